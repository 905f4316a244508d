use std::{
    f32::consts::PI,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use hound::{SampleFormat, WavSpec, WavWriter};
use image::{Rgb, RgbImage};
use midly::{
    num::{u15, u28, u4, u7},
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
};
use mmbake::{
    config::{PIANO_ROLL_PITCHES, PLACEHOLDER_FILL},
    sample_rng,
    visual::{frame_path, preprocess},
    Catalog, Dataset, DatasetConfig, Error, Mode, Vocabulary,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const TARGET_LENGTH: usize = 64;
const MEL_BINS: usize = 32;
const IM_RES: u32 = 16;

struct Corpus {
    dir: TempDir,
}

impl Corpus {
    fn new() -> Self {
        let corpus = Self { dir: tempfile::tempdir().unwrap() };
        fs::create_dir_all(corpus.frames()).unwrap();
        let mut labels = fs::File::create(corpus.labels()).unwrap();
        writeln!(labels, "index,mid,display_name").unwrap();
        writeln!(labels, "0,/m/dog,Dog").unwrap();
        writeln!(labels, "1,/m/cat,Cat").unwrap();
        writeln!(labels, "2,/m/bird,\"Bird, song\"").unwrap();
        corpus
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn frames(&self) -> PathBuf {
        self.path("frames")
    }

    fn labels(&self) -> PathBuf {
        self.path("labels.csv")
    }

    fn write_wav(&self, name: &str, seconds: f32) -> PathBuf {
        let path = self.path(name);
        let spec = WavSpec { channels: 1, sample_rate: 16000, bits_per_sample: 16, sample_format: SampleFormat::Int };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for i in 0..(seconds * 16000.0) as usize {
            let s = (2.0 * PI * 330.0 * i as f32 / 16000.0).sin() * 0.3;
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn write_midi(&self, name: &str, key: u8) -> PathBuf {
        let kind = |message| TrackEventKind::Midi { channel: u4::new(0), message };
        let track = vec![
            TrackEvent { delta: u28::new(0), kind: kind(MidiMessage::NoteOn { key: u7::new(key), vel: u7::new(80) }) },
            TrackEvent { delta: u28::new(480), kind: kind(MidiMessage::NoteOff { key: u7::new(key), vel: u7::new(0) }) },
            TrackEvent { delta: u28::new(0), kind: TrackEventKind::Meta(MetaMessage::EndOfTrack) },
        ];
        let smf = Smf { header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))), tracks: vec![track] };
        let path = self.path(name);
        smf.save(&path).unwrap();
        path
    }

    fn write_frame(&self, id: &str, frame: usize, color: [u8; 3]) {
        let path = frame_path(self.frames().to_str().unwrap(), id, frame);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(24, 20, Rgb(color)).save(&path).unwrap();
    }

    fn entry(&self, audio: &Path, symbolic: &Path, labels: &str, id: &str) -> Value {
        json!({
            "wav1": audio.to_str().unwrap(),
            "wav2": symbolic.to_str().unwrap(),
            "labels": labels,
            "video_id": id,
            "video_path": self.frames().to_str().unwrap(),
        })
    }

    /// Two intact records and one whose media is entirely missing.
    fn catalog(&self) -> Catalog {
        let a = self.entry(&self.write_wav("a.wav", 1.0), &self.write_midi("a.mid", 60), "/m/dog", "a");
        let b = self.entry(&self.write_wav("b.wav", 0.3), &self.write_midi("b.mid", 67), "/m/cat", "b");
        let missing = self.entry(&self.path("gone.wav"), &self.path("gone.mid"), "/m/bird", "gone");
        for k in 0..3 {
            self.write_frame("a", k, [200, 40, 40]);
            self.write_frame("b", k, [40, 40, 200]);
        }
        Catalog::build(&[a, b, missing]).unwrap()
    }

    fn dataset(&self, config: DatasetConfig) -> Dataset {
        Dataset::new(self.catalog(), Vocabulary::load(self.labels()).unwrap(), config).unwrap()
    }
}

fn config() -> DatasetConfig {
    DatasetConfig {
        num_mel_bins: MEL_BINS,
        target_length: TARGET_LENGTH,
        total_frame: 3,
        im_res: IM_RES,
        skip_norm: true,
        ..Default::default()
    }
}

#[test]
fn shapes_hold_for_every_record() {
    let corpus = Corpus::new();
    let config = DatasetConfig {
        dataset: Some("audioset".into()),
        skip_norm: false,
        freqm: 8,
        timem: 16,
        noise: true,
        ..config()
    };
    let dataset = corpus.dataset(config);
    for index in 0..dataset.len() {
        let example = dataset.get(index, &mut sample_rng(7, index)).unwrap();
        assert_eq!(example.audio.shape(), [TARGET_LENGTH, MEL_BINS]);
        assert_eq!(example.piano_roll.shape(), [TARGET_LENGTH, PIANO_ROLL_PITCHES]);
        assert_eq!(example.image.shape(), [3, IM_RES as usize, IM_RES as usize]);
        assert_eq!(example.target.len(), 3);
    }
}

#[test]
fn missing_media_yields_placeholders() {
    let corpus = Corpus::new();
    let dataset = corpus.dataset(config());
    let example = dataset.get(2, &mut sample_rng(0, 2)).unwrap();
    assert!(example.audio.as_slice().iter().all(|&v| v == PLACEHOLDER_FILL));
    assert!(example.piano_roll.as_slice().iter().all(|&v| v == PLACEHOLDER_FILL));
    assert!(example.image.as_slice().iter().all(|&v| v == PLACEHOLDER_FILL));
    assert_eq!(example.target, vec![0.0, 0.0, 1.0]);
}

#[test]
fn plain_examples_carry_smoothed_one_hot_targets() {
    let corpus = Corpus::new();
    let dataset = corpus.dataset(DatasetConfig { label_smooth: 0.3, ..config() });
    let example = dataset.get(1, &mut sample_rng(0, 1)).unwrap();
    assert!(example.mix.is_none());
    let expected = [0.1, 0.7, 0.1];
    for (v, e) in example.target.iter().zip(expected) {
        assert!((v - e).abs() < 1e-6, "{:?}", example.target);
    }
    // Short audio is zero-padded at the end.
    assert!(example.audio.row(TARGET_LENGTH - 1).iter().all(|&v| v == 0.0));
}

#[test]
fn mixed_examples_blend_targets() {
    let corpus = Corpus::new();
    let dataset = corpus.dataset(DatasetConfig { mixup: 1.0, ..config() });
    for seed in 0..10 {
        let example = dataset.get(0, &mut sample_rng(seed, 0)).unwrap();
        let mix = example.mix.expect("mixup rate 1 always blends");
        assert!(mix.index < dataset.len());
        assert!(mix.lambda > 0.0 && mix.lambda < 1.0);

        // Every record has one label, so the shares always add up to one.
        let sum: f32 = example.target.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        if mix.index != 0 {
            assert!((example.target[0] as f64 - mix.lambda).abs() < 1e-5);
        }
    }
}

#[test]
fn same_seed_same_example() {
    let corpus = Corpus::new();
    let dataset = corpus.dataset(DatasetConfig { mixup: 0.5, noise: true, freqm: 4, ..config() });
    let first = dataset.get(0, &mut sample_rng(3, 0)).unwrap();
    let again = dataset.get(0, &mut sample_rng(3, 0)).unwrap();
    assert_eq!(first.audio, again.audio);
    assert_eq!(first.image, again.image);
    assert_eq!(first.mix, again.mix);
}

#[test]
fn eval_mode_falls_back_to_last_existing_frame() {
    let corpus = Corpus::new();
    let catalog = corpus.catalog();
    // Frames 0..=4 exist for "a"; only frame 4 is green.
    corpus.write_frame("a", 3, [200, 40, 40]);
    corpus.write_frame("a", 4, [40, 200, 40]);
    let config = DatasetConfig { mode: Mode::Eval, total_frame: 10, frame_use: Some(7), ..config() };
    let dataset = Dataset::new(catalog, Vocabulary::load(corpus.labels()).unwrap(), config).unwrap();

    let example = dataset.get(0, &mut sample_rng(0, 0)).unwrap();
    let expected = preprocess(&frame_path(corpus.frames().to_str().unwrap(), "a", 4), IM_RES).unwrap();
    assert_eq!(example.image, expected);
}

#[test]
fn unknown_label_is_fatal() {
    let corpus = Corpus::new();
    let entry = corpus.entry(&corpus.path("x.wav"), &corpus.path("x.mid"), "/m/dog,/m/unicorn", "x");
    let catalog = Catalog::build(&[entry]).unwrap();
    let dataset = Dataset::new(catalog, Vocabulary::load(corpus.labels()).unwrap(), config()).unwrap();
    assert!(matches!(
        dataset.get(0, &mut sample_rng(0, 0)),
        Err(Error::UnknownLabel(id)) if id == "/m/unicorn"
    ));
}

#[test]
fn vocabulary_reads_quoted_names() {
    let corpus = Corpus::new();
    let vocab = Vocabulary::load(corpus.labels()).unwrap();
    assert_eq!(vocab.len(), 3);
    assert_eq!(vocab.index_of("/m/bird").unwrap(), 2);
    assert_eq!(vocab.display_name(2), Some("Bird, song"));
}
