//! Model file codec: versioned delimiter-tagged header, vocabulary table,
//! and a text or binary weight payload.
//!
//! # File layout
//!
//! The header is a sequence of `name: value` lines in a fixed order (see
//! [`save`]); the reader scans to each `:` and parses the next whitespace
//! token, so it tolerates cosmetic whitespace differences but not
//! reordering. The vocabulary table follows (`id count word class` per row),
//! then the payload: hidden activations, input-to-hidden weights,
//! hidden-to-output weights (split into hidden-to-compression and
//! compression-to-output when the compression layer is enabled), and the
//! direct-connection table.
//!
//! Text payloads hold one decimal value per line; binary payloads hold one
//! little-endian `f32` per value with no section markers.
//!
//! # Versioning
//!
//! Files declare a format version. The current version is
//! [`MODEL_VERSION`]; versions back to [`MIN_MODEL_VERSION`] load with
//! defaults for the fields introduced later (`direct connections` from
//! version 6, `direct order` from version 7, `bptt block` from version 5).
//! Anything outside the range is rejected.
//!
//! # Atomicity
//!
//! [`save`] writes `<path>.temp` and renames it over the target, so a crash
//! mid-save never leaves a truncated model at the final path.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;

use crate::config::{ClassingScheme, FileType, RnnConfig};
use crate::error::{ModelError, ModelResult};
use crate::model::RnnLm;
use crate::network::NetworkState;
use crate::trainer::{LearningSchedule, TrainProgress};
use crate::vocab::{VocabWord, Vocabulary};

/// Format version written by this build.
pub const MODEL_VERSION: u32 = 10;

/// Oldest format version the loader accepts.
pub const MIN_MODEL_VERSION: u32 = 4;

/// Default n-gram order assumed for pre-version-7 files that carry direct
/// connections but predate the order field.
const LEGACY_DIRECT_ORDER: usize = 3;

fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".temp");
    PathBuf::from(os)
}

/// Saves the model atomically: the full file is written to `<path>.temp`,
/// then renamed over `path`.
///
/// # Errors
///
/// I/O failures while writing or renaming.
pub fn save(model: &RnnLm, path: &Path) -> ModelResult<()> {
    let temp = temp_path(path);
    {
        let mut w = BufWriter::new(File::create(&temp)?);
        write_model(model, &mut w)?;
        w.flush()?;
    }
    fs::rename(&temp, path)?;
    info!(path = %path.display(), "model saved");
    Ok(())
}

fn write_model<W: Write>(model: &RnnLm, w: &mut W) -> ModelResult<()> {
    let state = &model.state;
    let cfg = &model.config;
    let progress = &model.progress;
    let schedule = &model.schedule;

    writeln!(w, "version: {MODEL_VERSION}")?;
    writeln!(w, "file format: {}\n", cfg.file_type.as_flag())?;
    writeln!(w, "training data file: {}", cfg.train_source)?;
    writeln!(w, "validation data file: {}\n", cfg.valid_source)?;
    writeln!(
        w,
        "last probability of validation data: {:.6}",
        progress.last_logp
    )?;
    writeln!(w, "number of finished iterations: {}", progress.iter)?;
    writeln!(w, "current position in training data: {}", progress.cur_pos)?;
    writeln!(
        w,
        "current probability of training data: {:.6}",
        progress.logp
    )?;
    writeln!(
        w,
        "save after processing # words: {}",
        cfg.checkpoint_interval
    )?;
    writeln!(w, "# of training words: {}", progress.train_words)?;
    writeln!(w, "input layer size: {}", state.layer0_size())?;
    writeln!(w, "hidden layer size: {}", state.hidden_size)?;
    writeln!(w, "compression layer size: {}", state.compression_size)?;
    writeln!(w, "output layer size: {}", state.layer2_size())?;
    writeln!(w, "direct connections: {}", state.syn_d.len())?;
    writeln!(w, "direct order: {}", cfg.direct_order)?;
    writeln!(w, "bptt: {}", cfg.bptt)?;
    writeln!(w, "bptt block: {}", cfg.bptt_block)?;
    writeln!(w, "vocabulary size: {}", model.vocab.len())?;
    writeln!(w, "class size: {}", state.class_size)?;
    writeln!(
        w,
        "old classes: {}",
        u8::from(matches!(cfg.classing, ClassingScheme::Frequency))
    )?;
    writeln!(
        w,
        "independent sentences mode: {}",
        u8::from(cfg.independent)
    )?;
    writeln!(w, "starting learning rate: {:.6}", schedule.starting_alpha)?;
    writeln!(w, "current learning rate: {:.6}", schedule.alpha)?;
    writeln!(w, "learning rate decrease: {}", u8::from(schedule.dividing))?;
    writeln!(w, "\n\nVocabulary:")?;
    for (id, entry) in model.vocab.words().iter().enumerate() {
        writeln!(
            w,
            "{:6}\t{:10}\t{}\t{}",
            id, entry.count, entry.word, entry.class_index
        )?;
    }

    match cfg.file_type {
        FileType::Text => {
            writeln!(w, "\nHidden layer activation:")?;
            for n in &state.neu1 {
                writeln!(w, "{:.4}", n.ac)?;
            }
            writeln!(w, "\nWeights 0->1:")?;
            for v in &state.syn0 {
                writeln!(w, "{v:.4}")?;
            }
            if state.compression_size > 0 {
                writeln!(w, "\nWeights 1->c:")?;
                for v in &state.syn1 {
                    writeln!(w, "{v:.4}")?;
                }
                writeln!(w, "\nWeights c->2:")?;
                for v in &state.sync {
                    writeln!(w, "{v:.4}")?;
                }
            } else {
                writeln!(w, "\nWeights 1->2:")?;
                for v in &state.syn1 {
                    writeln!(w, "{v:.4}")?;
                }
            }
            writeln!(w, "\nDirect connections:")?;
            for v in &state.syn_d {
                writeln!(w, "{v:.2}")?;
            }
        }
        FileType::Binary => {
            // The byte after the last vocabulary row separates text from
            // payload; raw little-endian f32 values follow immediately.
            for n in &state.neu1 {
                w.write_all(&(n.ac as f32).to_le_bytes())?;
            }
            for v in &state.syn0 {
                w.write_all(&(*v as f32).to_le_bytes())?;
            }
            for v in &state.syn1 {
                w.write_all(&(*v as f32).to_le_bytes())?;
            }
            for v in &state.sync {
                w.write_all(&(*v as f32).to_le_bytes())?;
            }
            for v in &state.syn_d {
                w.write_all(&(*v as f32).to_le_bytes())?;
            }
        }
    }
    Ok(())
}

/// Loads a model saved by [`save`], rebuilding the vocabulary (with
/// partition validation), sizing the network, and refreshing the rollback
/// snapshot.
///
/// # Errors
///
/// [`ModelError::UnsupportedVersion`] for out-of-range versions,
/// [`ModelError::MalformedModel`] for structural damage, and I/O failures.
pub fn load(path: &Path) -> ModelResult<RnnLm> {
    let mut r = ModelReader::new(File::open(path)?);

    let version: i64 = r.field()?;
    if version < i64::from(MIN_MODEL_VERSION) || version > i64::from(MODEL_VERSION) {
        return Err(ModelError::UnsupportedVersion {
            found: version,
            min: MIN_MODEL_VERSION,
            max: MODEL_VERSION,
        });
    }
    let file_type = FileType::from_flag(r.field()?)?;
    r.skip_past(b':')?;
    let train_source = r.token()?;
    r.skip_past(b':')?;
    let valid_source = r.token()?;
    let last_logp: f64 = r.field()?;
    let iter: u64 = r.field()?;
    let cur_pos: u64 = r.field()?;
    let logp: f64 = r.field()?;
    let checkpoint_interval: u64 = r.field()?;
    let train_words: u64 = r.field()?;
    let layer0_size: usize = r.field()?;
    let hidden_size: usize = r.field()?;
    let compression_size: usize = r.field()?;
    let layer2_size: usize = r.field()?;
    let direct_size: usize = if version > 5 { r.field()? } else { 0 };
    let direct_order: usize = if version > 6 {
        r.field()?
    } else if direct_size > 0 {
        LEGACY_DIRECT_ORDER
    } else {
        0
    };
    let bptt: usize = r.field()?;
    let bptt_block: usize = if version > 4 { r.field()? } else { 10 };
    let vocab_size: usize = r.field()?;
    let class_size: usize = r.field()?;
    let old_classes: i64 = r.field()?;
    let independent: i64 = r.field()?;
    let starting_alpha: f64 = r.field()?;
    let alpha: f64 = r.field()?;
    let dividing: i64 = r.field()?;

    if layer0_size != vocab_size + hidden_size {
        return Err(ModelError::malformed(format!(
            "input layer size {layer0_size} does not match vocabulary {vocab_size} + hidden {hidden_size}"
        )));
    }
    if layer2_size != vocab_size + class_size {
        return Err(ModelError::malformed(format!(
            "output layer size {layer2_size} does not match vocabulary {vocab_size} + classes {class_size}"
        )));
    }

    let config = RnnConfig {
        hidden_size,
        compression_size,
        class_size,
        classing: if old_classes != 0 {
            ClassingScheme::Frequency
        } else {
            ClassingScheme::SqrtFrequency
        },
        direct_size,
        direct_order,
        bptt,
        bptt_block,
        independent: independent != 0,
        learning_rate: starting_alpha,
        checkpoint_interval,
        file_type,
        train_source,
        valid_source,
        ..RnnConfig::default()
    };
    config.validate()?;

    // Vocabulary table, after the "Vocabulary:" marker.
    r.skip_past(b':')?;
    let mut rows = Vec::with_capacity(vocab_size);
    for expected_id in 0..vocab_size {
        let id: usize = r.value()?;
        if id != expected_id {
            return Err(ModelError::malformed(format!(
                "vocabulary row {expected_id} carries id {id}"
            )));
        }
        let count: u64 = r.value()?;
        let word = r.token()?;
        let class_index: usize = r.value()?;
        if class_index >= class_size {
            return Err(ModelError::malformed(format!(
                "word {word:?} assigned to class {class_index}, but only {class_size} classes exist"
            )));
        }
        rows.push(VocabWord {
            word,
            count,
            class_index,
        });
    }
    let vocab = Vocabulary::from_rows(rows, class_size)?;

    let mut state = NetworkState::sized(&config, vocab_size);
    match file_type {
        FileType::Text => {
            r.skip_past(b':')?;
            for n in &mut state.neu1 {
                n.ac = r.value()?;
            }
            r.skip_past(b':')?;
            for v in &mut state.syn0 {
                *v = r.value()?;
            }
            r.skip_past(b':')?;
            for v in &mut state.syn1 {
                *v = r.value()?;
            }
            if compression_size > 0 {
                r.skip_past(b':')?;
                for v in &mut state.sync {
                    *v = r.value()?;
                }
            }
            // Pre-v6 files have no direct-connection section at all, and a
            // zero-sized table needs no payload either way.
            if direct_size > 0 {
                r.skip_past(b':')?;
                for v in &mut state.syn_d {
                    *v = r.value()?;
                }
            }
        }
        FileType::Binary => {
            // Consume the newline terminating the last vocabulary row.
            r.skip_byte()?;
            for n in &mut state.neu1 {
                n.ac = r.read_f32()?;
            }
            for v in &mut state.syn0 {
                *v = r.read_f32()?;
            }
            for v in &mut state.syn1 {
                *v = r.read_f32()?;
            }
            for v in &mut state.sync {
                *v = r.read_f32()?;
            }
            for v in &mut state.syn_d {
                *v = r.read_f32()?;
            }
        }
    }
    state.refresh_backup();

    let schedule = LearningSchedule {
        starting_alpha,
        alpha,
        dividing: dividing != 0,
    };
    let progress = TrainProgress {
        iter,
        cur_pos,
        counter: cur_pos,
        logp,
        last_logp,
        train_words,
    };
    info!(
        path = %path.display(),
        version,
        vocab_size,
        hidden_size,
        "model restored"
    );
    Ok(RnnLm::from_parts(config, vocab, state, schedule, progress))
}

/// Byte-level reader combining delimiter scanning, whitespace-separated
/// token parsing, and raw little-endian reads over one buffered stream.
struct ModelReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> ModelReader<R> {
    fn new(source: R) -> Self {
        Self {
            inner: BufReader::new(source),
        }
    }

    fn peek(&mut self) -> ModelResult<Option<u8>> {
        let buf = self.inner.fill_buf()?;
        Ok(buf.first().copied())
    }

    fn bump(&mut self) {
        self.inner.consume(1);
    }

    /// Advances past the next occurrence of `delim`.
    fn skip_past(&mut self, delim: u8) -> ModelResult<()> {
        loop {
            match self.peek()? {
                None => {
                    return Err(ModelError::malformed(format!(
                        "unexpected end of file while scanning for {:?}",
                        delim as char
                    )))
                }
                Some(b) => {
                    self.bump();
                    if b == delim {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Consumes exactly one byte.
    fn skip_byte(&mut self) -> ModelResult<()> {
        match self.peek()? {
            Some(_) => {
                self.bump();
                Ok(())
            }
            None => Err(ModelError::malformed(
                "unexpected end of file before payload",
            )),
        }
    }

    /// Next whitespace-separated token.
    fn token(&mut self) -> ModelResult<String> {
        while matches!(self.peek()?, Some(b) if b.is_ascii_whitespace()) {
            self.bump();
        }
        let mut out = Vec::new();
        while let Some(b) = self.peek()? {
            if b.is_ascii_whitespace() {
                break;
            }
            out.push(b);
            self.bump();
        }
        if out.is_empty() {
            return Err(ModelError::malformed(
                "unexpected end of file while reading a value",
            ));
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Next token, parsed.
    fn value<T: FromStr>(&mut self) -> ModelResult<T> {
        let token = self.token()?;
        token
            .parse()
            .map_err(|_| ModelError::malformed(format!("cannot parse value {token:?}")))
    }

    /// Skips to the next `:` and parses the token after it.
    fn field<T: FromStr>(&mut self) -> ModelResult<T> {
        self.skip_past(b':')?;
        self.value()
    }

    /// One little-endian `f32`, widened.
    fn read_f32(&mut self) -> ModelResult<f64> {
        let mut bytes = [0u8; 4];
        self.inner.read_exact(&mut bytes)?;
        Ok(f64::from(f32::from_le_bytes(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::BOUNDARY_TOKEN;

    fn sample_model(file_type: FileType) -> RnnLm {
        let vocab = Vocabulary::from_counts([
            (BOUNDARY_TOKEN, 3u64),
            ("one", 7),
            ("two", 5),
            ("three", 2),
        ]);
        let config = RnnConfig {
            hidden_size: 4,
            class_size: 2,
            direct_size: 128,
            direct_order: 2,
            file_type,
            ..RnnConfig::default()
        };
        RnnLm::new(config, vocab).unwrap()
    }

    #[test]
    fn test_text_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rnn");
        let mut model = sample_model(FileType::Text);
        model.state.syn_d[5] = 1.25;
        save(&model, &path).unwrap();

        let restored = load(&path).unwrap();
        assert_eq!(restored.vocab().len(), model.vocab().len());
        assert_eq!(restored.config().hidden_size, 4);
        assert_eq!(restored.config().direct_size, 128);
        for (a, b) in model.state.syn0.iter().zip(&restored.state.syn0) {
            assert!((a - b).abs() < 5e-5, "text weights keep 4 decimals: {a} vs {b}");
        }
        assert!((restored.state.syn_d[5] - 1.25).abs() < 5e-3);
    }

    #[test]
    fn test_binary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rnn");
        let model = sample_model(FileType::Binary);
        save(&model, &path).unwrap();

        let restored = load(&path).unwrap();
        for (a, b) in model.state.syn0.iter().zip(&restored.state.syn0) {
            assert!((a - b).abs() < 1e-6, "binary weights keep f32 precision");
        }
        assert_eq!(
            restored.config().file_type,
            FileType::Binary
        );
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rnn");
        save(&sample_model(FileType::Text), &path).unwrap();
        assert!(path.exists());
        assert!(!temp_path(&path).exists());
    }

    // Hand-built legacy files: three words in two classes, a two-unit hidden
    // layer, and no compression. Versions 4 and 5 predate the direct
    // connection fields and payload section; version 5 and 6 carry the bptt
    // block field.
    fn legacy_file(version: u32, direct_size: usize) -> String {
        let mut f = String::new();
        f.push_str(&format!("version: {version}\n"));
        f.push_str("file format: 0\n\n");
        f.push_str("training data file: train.txt\n");
        f.push_str("validation data file: valid.txt\n\n");
        f.push_str("last probability of validation data: -100000000.000000\n");
        f.push_str("number of finished iterations: 0\n");
        f.push_str("current position in training data: 0\n");
        f.push_str("current probability of training data: 0.000000\n");
        f.push_str("save after processing # words: 0\n");
        f.push_str("# of training words: 0\n");
        f.push_str("input layer size: 5\n");
        f.push_str("hidden layer size: 2\n");
        f.push_str("compression layer size: 0\n");
        f.push_str("output layer size: 5\n");
        if version > 5 {
            f.push_str(&format!("direct connections: {direct_size}\n"));
        }
        f.push_str("bptt: 0\n");
        if version > 4 {
            f.push_str("bptt block: 7\n");
        }
        f.push_str("vocabulary size: 3\n");
        f.push_str("class size: 2\n");
        f.push_str("old classes: 0\n");
        f.push_str("independent sentences mode: 0\n");
        f.push_str("starting learning rate: 0.100000\n");
        f.push_str("current learning rate: 0.100000\n");
        f.push_str("learning rate decrease: 0\n");
        f.push_str("\n\nVocabulary:\n");
        f.push_str("     0\t         5\t</s>\t0\n");
        f.push_str("     1\t         9\tone\t0\n");
        f.push_str("     2\t         4\ttwo\t1\n");
        f.push_str("\nHidden layer activation:\n");
        for _ in 0..2 {
            f.push_str("0.1000\n");
        }
        f.push_str("\nWeights 0->1:\n");
        for _ in 0..10 {
            f.push_str("0.0100\n");
        }
        f.push_str("\nWeights 1->2:\n");
        for _ in 0..10 {
            f.push_str("0.0200\n");
        }
        if direct_size > 0 {
            f.push_str("\nDirect connections:\n");
            for _ in 0..direct_size {
                f.push_str("0.25\n");
            }
        }
        f
    }

    #[test]
    fn test_version_4_text_file_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rnn");
        fs::write(&path, legacy_file(4, 0)).unwrap();

        let mut restored = load(&path).unwrap();
        assert_eq!(restored.config().direct_size, 0);
        assert_eq!(restored.config().direct_order, 0);
        assert_eq!(restored.config().bptt_block, 10);
        assert_eq!(restored.vocab().len(), 3);
        assert!((restored.state.syn0[0] - 0.01).abs() < 1e-9);
        let score = restored.score(&[Some(1), Some(2), Some(0)]).unwrap();
        assert!(score.is_finite() && score < 0.0);
    }

    #[test]
    fn test_version_6_file_assumes_legacy_direct_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rnn");
        fs::write(&path, legacy_file(6, 4)).unwrap();

        let restored = load(&path).unwrap();
        assert_eq!(restored.config().direct_size, 4);
        assert_eq!(restored.config().direct_order, LEGACY_DIRECT_ORDER);
        assert_eq!(restored.config().bptt_block, 7);
        assert!((restored.state.syn_d[0] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_round_trip_preserves_empty_trailing_classes() {
        // Five classes over a three-word vocabulary: the tail of the
        // partition is empty but must survive the round trip so every class
        // index stays addressable.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rnn");
        let vocab = Vocabulary::from_counts([(BOUNDARY_TOKEN, 1u64), ("x", 3), ("y", 2)]);
        let config = RnnConfig {
            hidden_size: 3,
            class_size: 5,
            ..RnnConfig::default()
        };
        let model = RnnLm::new(config, vocab).unwrap();
        assert_eq!(model.vocab().class_count(), 5);
        save(&model, &path).unwrap();

        let restored = load(&path).unwrap();
        assert_eq!(restored.vocab().class_count(), 5);
        assert_eq!(restored.vocab().class_range(4).len, 0);
    }

    #[test]
    fn test_future_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rnn");
        fs::write(&path, "version: 11\nfile format: 0\n").unwrap();
        assert!(matches!(
            load(&path),
            Err(ModelError::UnsupportedVersion { found: 11, .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rnn");
        let model = sample_model(FileType::Text);
        save(&model, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, &text[..text.len() / 2]).unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            load(Path::new("/nonexistent/model.rnn")),
            Err(ModelError::Io(_))
        ));
    }
}
