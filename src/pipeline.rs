use ahash::AHashMap;
use anyhow::{bail, Context, Result};
use custom_error::custom_error;
use itertools::Itertools;
use rayon::prelude::*;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

use crate::info::PipelineStats;
use crate::io::{FastqReader, FastqWriter};
use crate::matcher::{BarcodeMatcher, MatchResult};
use crate::sequence;

custom_error! {pub PipelineError
    FileLengthMismatch{counts: String} = "The synchronized FASTQ inputs returned unequal record counts.  {counts}",
    BadTemplate{pattern: String, problem: String} = "Bad output name template '{pattern}': {problem}",
    UnknownField{field: String} = "Output name template field '{field}' is not read_name, lane, tile, x, y, or a registered barcode",
    ConfigFrozen = "Pipeline settings cannot change after read_chunk has been called",
}

// 0-based positions of the attributes within a bcl2fastq2 read name split by ':'
const PARSED_ATTRIBUTES: [(&str, usize); 4] = [("lane", 3), ("tile", 4), ("x", 5), ("y", 6)];

#[derive(Debug)]
enum NameField {
    ReadName,
    Attribute { name: &'static str, position: usize },
    Barcode(String),
}

/// A parsed output name pattern: literal text alternating with field substitutions.
/// Fields reference the raw read name, one of the positional attributes parsed out of
/// an Illumina style name, or the best match label of a registered barcode
#[derive(Debug)]
struct NameTemplate {
    pattern: String,
    literals: Vec<String>,
    fields: Vec<NameField>,
}

impl NameTemplate {
    /// Parses the brace grammar and binds every field.  Unbalanced braces and fields
    /// that name nothing are caught here, which runs at first chunk validation
    fn parse(pattern: &str, barcode_names: &[String]) -> Result<Self> {
        let field_search = Regex::new(r"\{([^{}]*)\}")?;
        let mut literals = Vec::new();
        let mut fields = Vec::new();
        let mut cursor = 0;
        for capture in field_search.captures_iter(pattern) {
            let whole = capture.get(0).unwrap();
            let field_name = capture.get(1).unwrap().as_str();
            literals.push(pattern[cursor..whole.start()].to_string());
            cursor = whole.end();

            if field_name == "read_name" {
                fields.push(NameField::ReadName);
            } else if let Some(&(name, position)) = PARSED_ATTRIBUTES
                .iter()
                .find(|(name, _)| *name == field_name)
            {
                fields.push(NameField::Attribute { name, position });
            } else if barcode_names.iter().any(|name| name == field_name) {
                fields.push(NameField::Barcode(field_name.to_string()));
            } else {
                return Err(PipelineError::UnknownField {
                    field: field_name.to_string(),
                }
                .into());
            }
        }
        literals.push(pattern[cursor..].to_string());
        if literals
            .iter()
            .any(|literal| literal.contains('{') || literal.contains('}'))
        {
            return Err(PipelineError::BadTemplate {
                pattern: pattern.to_string(),
                problem: "unbalanced braces".to_string(),
            }
            .into());
        }
        Ok(NameTemplate {
            pattern: pattern.to_string(),
            literals,
            fields,
        })
    }

    /// Builds the output name for one record.  The read name is only split on ':' when
    /// a positional attribute is actually referenced, and a name with too few colons
    /// only fails in that case
    fn resolve(
        &self,
        index: usize,
        read_name: &str,
        matches: &AHashMap<String, MatchResult>,
    ) -> Result<String> {
        let mut name = String::new();
        let mut attributes: Option<Vec<&str>> = None;
        for (literal, field) in self.literals.iter().zip(&self.fields) {
            name.push_str(literal);
            match field {
                NameField::ReadName => name.push_str(read_name),
                NameField::Attribute {
                    name: attribute,
                    position,
                } => {
                    let parts =
                        attributes.get_or_insert_with(|| read_name.split(':').collect());
                    match parts.get(*position) {
                        Some(part) => name.push_str(part),
                        None => {
                            return Err(PipelineError::BadTemplate {
                                pattern: self.pattern.clone(),
                                problem: format!(
                                    "read name '{}' has no {} field",
                                    read_name, attribute
                                ),
                            }
                            .into())
                        }
                    }
                }
                NameField::Barcode(barcode) => {
                    // An unmatched read substitutes as empty rather than failing the
                    // whole chunk; callers filter on match quality before writing
                    if let Some(label) = matches
                        .get(barcode)
                        .and_then(|result| result.label(index))
                    {
                        name.push_str(label);
                    }
                }
            }
        }
        name.push_str(&self.literals[self.fields.len()]);
        Ok(name)
    }
}

struct SequenceFile {
    name: String,
    reader: FastqReader,
    writer: Option<FastqWriter>,
}

impl SequenceFile {
    fn write_filtered(
        &mut self,
        filter: &[bool],
        template: &NameTemplate,
        matches: &AHashMap<String, MatchResult>,
    ) -> Result<()> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        for (index, _) in filter.iter().enumerate().filter(|(_, &keep)| keep) {
            let name = template.resolve(index, &self.reader.names[index], matches)?;
            writer.write_record(&name, &self.reader.seqs[index], &self.reader.quals[index])?;
        }
        Ok(())
    }
}

struct BarcodeConfig {
    name: String,
    matcher: Arc<dyn BarcodeMatcher>,
    sequence_name: String,
    match_start: usize,
}

/// Chunked matching over 2 to 4 synchronized FASTQ streams.  Sequences and barcode
/// matchers are registered up front, then each read_chunk pulls the same number of
/// records from every input in parallel, matches every configured barcode window, and
/// publishes the results.  write_chunk re-emits a filtered subset of the chunk with
/// templated read names
///
/// Record i of every input refers to the same biological read; keeping the files
/// synchronized is an invariant of the inputs.  The settings freeze once reading
/// starts, and one chunk's buffers and results are replaced by the next read_chunk
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use barcode_match::matcher::ListMatcher;
/// use barcode_match::pipeline::FastqPipeline;
///
/// # fn main() -> anyhow::Result<()> {
/// let sample = Arc::new(ListMatcher::new(
///     &["CAGTACTG", "AGTAGTCT"],
///     Some(&["sample_1", "sample_2"][..]),
/// )?);
/// let mut pipeline = FastqPipeline::new();
/// pipeline.add_sequence("R1", "R1.fastq.gz", Some("R1_out.fastq.gz"))?;
/// pipeline.add_sequence("I1", "I1.fastq.gz", None)?;
/// pipeline.add_barcode("sample", sample, "I1", 0)?;
/// pipeline.set_output_names("{sample}:{read_name}")?;
/// while pipeline.read_chunk(10000)? > 0 {
///     let result = pipeline.matches("sample").unwrap();
///     let keep = result.dist.iter().map(|&dist| dist <= 1).collect::<Vec<bool>>();
///     pipeline.write_chunk(&keep)?;
/// }
/// pipeline.close()?;
/// # Ok(())
/// # }
/// ```
pub struct FastqPipeline {
    files: Vec<SequenceFile>,
    barcodes: Vec<BarcodeConfig>,
    pattern: String,
    template: Option<NameTemplate>,
    threads: Option<usize>,
    pool: Option<rayon::ThreadPool>,
    matches: AHashMap<String, MatchResult>,
    stats: PipelineStats,
    chunk_len: usize,
    started: bool,
}

impl Default for FastqPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl FastqPipeline {
    pub fn new() -> Self {
        FastqPipeline {
            files: Vec::new(),
            barcodes: Vec::new(),
            pattern: "{read_name}".to_string(),
            template: None,
            threads: None,
            pool: None,
            matches: AHashMap::new(),
            stats: PipelineStats::new(),
            chunk_len: 0,
            started: false,
        }
    }

    /// Overrides the worker pool size.  The default is one worker per input file,
    /// capped at the core count
    pub fn with_threads(threads: usize) -> Self {
        let mut pipeline = Self::new();
        pipeline.threads = Some(threads);
        pipeline
    }

    /// Registers a FASTQ input under a symbolic name such as R1 or I1, with an
    /// optional output for filtered re-emission.  Paths ending in .gz read and write
    /// through gzip.  Registering a name again swaps in the new files
    pub fn add_sequence<P: AsRef<Path>>(
        &mut self,
        name: &str,
        input_path: P,
        output_path: Option<P>,
    ) -> Result<()> {
        if self.started {
            return Err(PipelineError::ConfigFrozen.into());
        }
        let reader = FastqReader::open(&input_path)?;
        let writer = match &output_path {
            Some(path) => Some(FastqWriter::create(path)?),
            None => None,
        };
        let file = SequenceFile {
            name: name.to_string(),
            reader,
            writer,
        };
        if let Some(existing) = self.files.iter_mut().find(|file| file.name == name) {
            *existing = file;
        } else {
            self.files.push(file);
        }
        Ok(())
    }

    /// Associates a matcher with the window starting at match_start within the named
    /// sequence.  The match results publish under the barcode name, which is also what
    /// the output name template uses to substitute the best match label
    pub fn add_barcode(
        &mut self,
        name: &str,
        matcher: Arc<dyn BarcodeMatcher>,
        sequence_name: &str,
        match_start: usize,
    ) -> Result<()> {
        if self.started {
            return Err(PipelineError::ConfigFrozen.into());
        }
        if name == "read_name"
            || PARSED_ATTRIBUTES
                .iter()
                .any(|(reserved, _)| *reserved == name)
        {
            bail!(
                "Barcode cannot use the reserved name {}.  read_name, lane, tile, x, and y belong to the output name template",
                name
            );
        }
        if self.barcodes.iter().any(|barcode| barcode.name == name) {
            bail!("A barcode named {} was already added", name);
        }
        self.barcodes.push(BarcodeConfig {
            name: name.to_string(),
            matcher,
            sequence_name: sequence_name.to_string(),
            match_start,
        });
        Ok(())
    }

    /// Sets the output read name pattern.  The pattern holds literal text around
    /// brace wrapped fields, each naming read_name, one of lane, tile, x, or y, or a
    /// registered barcode.  Parsing and field checks run at the first read_chunk
    pub fn set_output_names(&mut self, pattern: &str) -> Result<()> {
        if self.started {
            return Err(PipelineError::ConfigFrozen.into());
        }
        self.pattern = pattern.to_string();
        Ok(())
    }

    /// First call checks: every barcode references a registered sequence, the name
    /// template parses and only names known fields.  Also builds the worker pool.
    /// Later calls are no-ops
    fn validate(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        for barcode in &self.barcodes {
            if !self
                .files
                .iter()
                .any(|file| file.name == barcode.sequence_name)
            {
                bail!(
                    "Barcode {} matches on sequence {} but no such input was added",
                    barcode.name,
                    barcode.sequence_name
                );
            }
        }
        let barcode_names = self
            .barcodes
            .iter()
            .map(|barcode| barcode.name.clone())
            .collect::<Vec<String>>();
        self.template = Some(NameTemplate::parse(&self.pattern, &barcode_names)?);
        let threads = self
            .threads
            .unwrap_or_else(|| self.files.len().clamp(1, num_cpus::get()));
        self.pool = Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .context("Failed to build the worker pool")?,
        );
        self.started = true;
        Ok(())
    }

    /// Pulls up to max_records records from every input and matches every configured
    /// barcode, both fanned out across the worker pool.  Returns the record count,
    /// which is 0 once the inputs are exhausted.  All inputs must return the same
    /// count; anything else means the files fell out of sync
    pub fn read_chunk(&mut self, max_records: usize) -> Result<usize> {
        if self.files.is_empty() {
            bail!("No sequences have been added");
        }
        self.validate()?;
        let pool = self.pool.as_ref().unwrap();

        let counts = pool.install(|| {
            self.files
                .par_iter_mut()
                .map(|file| file.reader.read_chunk(max_records))
                .collect::<Result<Vec<usize>>>()
        })?;
        let records = counts[0];
        if counts.iter().any(|&count| count != records) {
            let counts = self
                .files
                .iter()
                .zip(&counts)
                .map(|(file, count)| format!("{}: {}", file.name, count))
                .join(", ");
            return Err(PipelineError::FileLengthMismatch { counts }.into());
        }

        self.chunk_len = records;
        self.matches.clear();
        if records == 0 {
            return Ok(0);
        }

        let chunk_seqs = self
            .files
            .iter()
            .map(|file| (file.name.as_str(), &file.reader.seqs))
            .collect::<AHashMap<&str, &Vec<String>>>();
        let results = pool.install(|| {
            self.barcodes
                .par_iter()
                .map(|barcode| {
                    let seqs = chunk_seqs[barcode.sequence_name.as_str()];
                    let end = barcode.match_start + barcode.matcher.bases();
                    let (words, n_flags) =
                        sequence::encode_range(seqs, barcode.match_start, end);
                    (
                        barcode.name.clone(),
                        barcode.matcher.match_all(&words, &n_flags),
                    )
                })
                .collect::<Vec<(String, MatchResult)>>()
        });
        for (name, result) in results {
            self.matches.insert(name, result);
        }
        self.stats.add_chunk(records);
        Ok(records)
    }

    /// Writes record i of the current chunk to every registered output wherever
    /// filter[i] is set, with names rebuilt from the template and sequence and quality
    /// lines passed through untouched.  One task per output file
    pub fn write_chunk(&mut self, filter: &[bool]) -> Result<()> {
        if !self.started {
            bail!("write_chunk was called before any chunk was read");
        }
        if filter.len() != self.chunk_len {
            bail!(
                "Filter of length {} does not cover the chunk of {} records",
                filter.len(),
                self.chunk_len
            );
        }
        let kept = filter.iter().filter(|&&keep| keep).count();
        if kept == 0 {
            return Ok(());
        }
        let template = self.template.as_ref().unwrap();
        let matches = &self.matches;
        let pool = self.pool.as_ref().unwrap();
        pool.install(|| {
            self.files
                .par_iter_mut()
                .try_for_each(|file| file.write_filtered(filter, template, matches))
        })?;
        self.stats.add_written(kept);
        Ok(())
    }

    /// Flushes and closes every output.  Safe to call more than once
    pub fn close(&mut self) -> Result<()> {
        for file in &mut self.files {
            if let Some(writer) = file.writer.as_mut() {
                writer.finish()?;
            }
        }
        Ok(())
    }

    /// Match results for a barcode from the most recent chunk
    pub fn matches(&self, barcode_name: &str) -> Option<&MatchResult> {
        self.matches.get(barcode_name)
    }

    /// Read names of the most recent chunk for a sequence
    pub fn read_names(&self, sequence_name: &str) -> Option<&[String]> {
        self.files
            .iter()
            .find(|file| file.name == sequence_name)
            .map(|file| file.reader.names.as_slice())
    }

    /// Raw bases of the most recent chunk for a sequence, trimmed to start at the
    /// given position.  Useful for pulling a UMI out of a read alongside the barcode
    /// matches
    pub fn read_bases(&self, sequence_name: &str, start: usize) -> Option<Vec<&str>> {
        self.files
            .iter()
            .find(|file| file.name == sequence_name)
            .map(|file| {
                file.reader
                    .seqs
                    .iter()
                    .map(|seq| seq.get(start..).unwrap_or(""))
                    .collect()
            })
    }

    /// Running totals over every chunk so far
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}
