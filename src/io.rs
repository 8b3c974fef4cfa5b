use anyhow::{bail, Context, Result};
use custom_error::custom_error;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

custom_error! {pub FastqError
    MissingAt{path: String, record: u64} = "Record {record} in {path} does not start with '@'.  Check the FASTQ format",
    MissingSeparator{path: String, record: u64} = "Record {record} in {path} is missing the '+' separator line.  Check the FASTQ format",
}

/// Buffered line reader over one FASTQ file, with a streaming gzip decoder layered in
/// front when the path ends in .gz.  Each call to read_chunk refills the three record
/// buffers in place, so earlier chunk contents are gone once the next chunk is read
///
/// FASTQ format:
/// Line 1: Sequence ID, starting with '@'
/// Line 2: DNA sequence
/// Line 3: +
/// Line 4: Quality score
pub struct FastqReader {
    path: String,
    reader: Box<dyn BufRead + Send>,
    records: u64,
    finished: bool,
    pub names: Vec<String>,
    pub seqs: Vec<String>,
    pub quals: Vec<String>,
}

impl FastqReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_string = path.as_ref().display().to_string();
        let file = File::open(&path).context(format!("Failed to open {}", path_string))?;
        let reader: Box<dyn BufRead + Send> = if path_string.ends_with(".gz") {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(FastqReader {
            path: path_string,
            reader,
            records: 0,
            finished: false,
            names: Vec::new(),
            seqs: Vec::new(),
            quals: Vec::new(),
        })
    }

    /// Reads up to max_records records into the name, sequence, and quality buffers and
    /// returns how many arrived.  The leading '@' is stripped from names and line
    /// endings are stripped everywhere.  A partial record at the end of the file is
    /// dropped, after which every later call returns 0
    pub fn read_chunk(&mut self, max_records: usize) -> Result<usize> {
        self.names.clear();
        self.seqs.clear();
        self.quals.clear();
        if self.finished {
            return Ok(0);
        }
        for _ in 0..max_records {
            let mut name = String::new();
            if self.read_line(&mut name)? == 0 {
                self.finished = true;
                break;
            }
            let mut seq = String::new();
            let mut separator = String::new();
            let mut qual = String::new();
            let mut complete = true;
            for line in [&mut seq, &mut separator, &mut qual] {
                if self.read_line(line)? == 0 {
                    complete = false;
                    break;
                }
            }
            if !complete {
                // Trailing partial record, dropped rather than surfaced
                self.finished = true;
                break;
            }
            self.records += 1;
            if !name.starts_with('@') {
                return Err(FastqError::MissingAt {
                    path: self.path.clone(),
                    record: self.records,
                }
                .into());
            }
            if !separator.starts_with('+') {
                return Err(FastqError::MissingSeparator {
                    path: self.path.clone(),
                    record: self.records,
                }
                .into());
            }
            name.remove(0);
            self.names.push(name);
            self.seqs.push(seq);
            self.quals.push(qual);
        }
        Ok(self.names.len())
    }

    /// Total records handed out so far
    pub fn records(&self) -> u64 {
        self.records
    }

    fn read_line(&mut self, line: &mut String) -> Result<usize> {
        let bytes = self
            .reader
            .read_line(line)
            .context(format!("Failed to read from {}", self.path))?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(bytes)
    }
}

enum FastqSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

/// Buffered FASTQ record writer, compressing through a streaming gzip encoder when the
/// path ends in .gz.  finish must be called so buffered data and the gzip trailer make
/// it to disk
pub struct FastqWriter {
    path: String,
    sink: Option<FastqSink>,
}

impl FastqWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_string = path.as_ref().display().to_string();
        let file = File::create(&path).context(format!("Failed to create {}", path_string))?;
        let buffer = BufWriter::new(file);
        let sink = if path_string.ends_with(".gz") {
            FastqSink::Gzip(GzEncoder::new(buffer, Compression::default()))
        } else {
            FastqSink::Plain(buffer)
        };
        Ok(FastqWriter {
            path: path_string,
            sink: Some(sink),
        })
    }

    /// Writes one record in the four line layout.  The name is passed without a leading
    /// '@', which is added here
    pub fn write_record(&mut self, name: &str, seq: &str, qual: &str) -> Result<()> {
        let sink: &mut dyn Write = match self.sink.as_mut() {
            Some(FastqSink::Plain(writer)) => writer,
            Some(FastqSink::Gzip(writer)) => writer,
            None => bail!("Attempted write to {} after it was closed", self.path),
        };
        write!(sink, "@{}\n{}\n+\n{}\n", name, seq, qual)
            .context(format!("Failed to write to {}", self.path))
    }

    /// Flushes everything out and, for gzip outputs, writes the trailer.  Later calls
    /// are no-ops
    pub fn finish(&mut self) -> Result<()> {
        match self.sink.take() {
            Some(FastqSink::Plain(mut writer)) => {
                writer
                    .flush()
                    .context(format!("Failed to flush {}", self.path))?;
            }
            Some(FastqSink::Gzip(writer)) => {
                writer
                    .finish()
                    .context(format!("Failed to finish gzip stream for {}", self.path))?
                    .flush()
                    .context(format!("Failed to flush {}", self.path))?;
            }
            None => (),
        }
        Ok(())
    }
}
