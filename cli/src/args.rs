use std::path::PathBuf;

use modelport_core::prelude::*;
use modelport_onnx::ExportConfig;
use structopt::StructOpt;

use crate::pipeline::PipelineConfig;

/// Converts a fine-tuned encoder checkpoint directory into ONNX, a
/// TensorFlow SavedModel and a single-file HDF5 package, all written next to
/// the checkpoint.
#[derive(Debug, StructOpt)]
#[structopt(name = "modelport")]
pub struct CliArgs {
    #[structopt(short = "v", parse(from_occurrences))]
    pub verbosity: usize,

    /// Checkpoint directory (config.json and safetensors weights)
    #[structopt(parse(from_os_str), default_value = "./fine-tuned-bert")]
    pub model_dir: PathBuf,

    /// ONNX opset version to export to
    #[structopt(long, default_value = "14")]
    pub opset: i64,

    /// Length of the synthetic input sequence
    #[structopt(long = "seq-len", default_value = "128")]
    pub seq_len: usize,

    /// Synthetic token ids are drawn from [0, vocab-range)
    #[structopt(long = "vocab-range", default_value = "30522")]
    pub vocab_range: i64,

    /// Seed for the synthetic input
    #[structopt(long)]
    pub seed: Option<u64>,

    /// Keep constant subgraphs in the exported graph
    #[structopt(long = "no-constant-folding")]
    pub no_constant_folding: bool,

    /// Refuse checkpoints declaring custom modeling code
    #[structopt(long = "no-trust-remote-code")]
    pub no_trust_remote_code: bool,

    /// Do not write model.pt
    #[structopt(long = "skip-checkpoint")]
    pub skip_checkpoint: bool,

    /// Log the graph converter's per-node mapping at debug level only
    #[structopt(long = "quiet-converter")]
    pub quiet_converter: bool,
}

impl CliArgs {
    pub fn log_level(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let default = PipelineConfig::default();
        let input = SyntheticInput::new(1, self.seq_len, self.vocab_range, self.seed);
        let export = ExportConfig::default()
            .with_opset(self.opset)
            .with_constant_folding(!self.no_constant_folding);
        let load = LoadOptions { trust_remote_code: !self.no_trust_remote_code };
        let convert = if self.quiet_converter { default.convert.clone().quiet() } else { default.convert.clone() };
        PipelineConfig { load, input, export, convert, write_checkpoint: !self.skip_checkpoint, ..default }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::from_iter_safe(std::iter::once("modelport").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.model_dir, PathBuf::from("./fine-tuned-bert"));
        assert_eq!(args.log_level(), "info");
        let config = args.pipeline_config();
        assert_eq!(config.input, SyntheticInput::new(1, 128, 30522, None));
        assert_eq!(config.export.opset_version, 14);
        assert!(config.export.do_constant_folding);
        assert!(config.load.trust_remote_code);
        assert!(config.write_checkpoint);
        assert!(config.convert.verbose);
    }

    #[test]
    fn flags() {
        let args = parse(&[
            "-vv",
            "models/x",
            "--opset",
            "17",
            "--seq-len",
            "64",
            "--seed",
            "4",
            "--no-constant-folding",
            "--no-trust-remote-code",
            "--skip-checkpoint",
            "--quiet-converter",
        ]);
        assert_eq!(args.log_level(), "trace");
        let config = args.pipeline_config();
        assert_eq!(config.input, SyntheticInput::new(1, 64, 30522, Some(4)));
        assert_eq!(config.export.opset_version, 17);
        assert!(!config.export.do_constant_folding);
        assert!(!config.load.trust_remote_code);
        assert!(!config.write_checkpoint);
        assert!(!config.convert.verbose);
    }
}
