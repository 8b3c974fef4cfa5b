use chrono::{DateTime, Duration, Local};
use num_format::{Locale, ToFormattedString};
use std::fmt;

/// Running totals for a pipeline.  Counts chunks, records pulled from the synchronized
/// inputs, and records written back out, along with the wall clock time since the
/// pipeline was created.  Displayed for progress and end of run reporting
///
/// # Example
/// ```
/// use barcode_match::info::PipelineStats;
///
/// let mut stats = PipelineStats::new();
/// stats.add_chunk(2000);
/// stats.add_written(1500);
/// assert_eq!(stats.reads(), 2000);
/// assert_eq!(stats.reads_written(), 1500);
/// ```
#[derive(Debug, Clone)]
pub struct PipelineStats {
    start_time: DateTime<Local>,
    chunks: u64,
    reads: u64,
    reads_written: u64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        PipelineStats {
            start_time: Local::now(),
            chunks: 0,
            reads: 0,
            reads_written: 0,
        }
    }

    /// Record one finished chunk of the given record count
    pub fn add_chunk(&mut self, records: usize) {
        self.chunks += 1;
        self.reads += records as u64;
    }

    /// Record records written to each output after filtering
    pub fn add_written(&mut self, records: usize) {
        self.reads_written += records as u64;
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn reads_written(&self) -> u64 {
        self.reads_written
    }

    /// Wall clock time since the pipeline was created
    pub fn elapsed(&self) -> Duration {
        Local::now() - self.start_time
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.elapsed();
        write!(
            f,
            "\
            Chunks processed:            {}\n\
            Total sequences:             {}\n\
            Sequences written:           {}\n\
            Elapsed: {} hours, {} minutes, {}.{} seconds",
            self.chunks.to_formatted_string(&Locale::en),
            self.reads.to_formatted_string(&Locale::en),
            self.reads_written.to_formatted_string(&Locale::en),
            elapsed.num_hours(),
            elapsed.num_minutes() % 60,
            elapsed.num_seconds() % 60,
            elapsed.num_milliseconds() - (elapsed.num_seconds() * 1000)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate() {
        let mut stats = PipelineStats::new();
        stats.add_chunk(1000);
        stats.add_chunk(400);
        stats.add_written(100);
        assert_eq!(stats.chunks(), 2);
        assert_eq!(stats.reads(), 1400);
        assert_eq!(stats.reads_written(), 100);
    }

    #[test]
    fn display_formats_counts() {
        let mut stats = PipelineStats::new();
        stats.add_chunk(1_250_000);
        assert!(stats.to_string().contains("1,250,000"));
    }
}
