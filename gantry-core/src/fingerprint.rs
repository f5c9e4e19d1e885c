//! Run fingerprints: a short digest of the hyperparameters that define a
//! distinct experiment.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::TrainingConfig;

/// Number of hex characters kept from the SHA-256 digest.
const DIGEST_LEN: usize = 8;

/// Deterministic identity of an experiment.
///
/// Only `lr`, `batch_size`, `latent_dim`, `ngf` and `ndf` participate, so two
/// runs that differ only in epochs or output locations share a fingerprint
/// (and therefore a checkpoint folder).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunFingerprint {
    digest: String,
    folder: String,
}

impl RunFingerprint {
    pub fn of(config: &TrainingConfig) -> Self {
        let key_params = format!(
            "{}_{}_{}_{}_{}",
            config.lr, config.batch_size, config.latent_dim, config.ngf, config.ndf
        );
        let hash = Sha256::digest(key_params.as_bytes());
        let digest: String = format!("{hash:x}").chars().take(DIGEST_LEN).collect();
        let folder = format!(
            "dcgan_lr{}_bs{}_latent{}_ngf{}_ndf{}_{}",
            config.lr, config.batch_size, config.latent_dim, config.ngf, config.ndf, digest
        );
        Self { digest, folder }
    }

    /// The short hex digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Directory name under the checkpoint base directory.
    pub fn folder_name(&self) -> &str {
        &self.folder
    }
}

impl fmt::Display for RunFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE_YAML;

    fn sample() -> TrainingConfig {
        TrainingConfig::from_yaml_str(SAMPLE_YAML).unwrap()
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = RunFingerprint::of(&sample());
        let b = RunFingerprint::of(&sample());
        assert_eq!(a, b);
        assert_eq!(a.digest().len(), DIGEST_LEN);
        assert!(a.digest().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_folder_name_embeds_hyperparameters() {
        let fp = RunFingerprint::of(&sample());
        assert_eq!(
            fp.folder_name(),
            format!("dcgan_lr0.0002_bs128_latent100_ngf64_ndf64_{}", fp.digest())
        );
    }

    #[test]
    fn test_digest_matches_sha256_prefix() {
        let expected = format!("{:x}", Sha256::digest(b"0.0002_128_100_64_64"));
        assert_eq!(RunFingerprint::of(&sample()).digest(), &expected[..8]);
    }

    #[test]
    fn test_unrelated_keys_do_not_change_fingerprint() {
        let base = sample();
        let mut other = base.clone();
        other.epochs = 50;
        other.checkpoint_interval = 7;
        other.tags = vec!["ablation".into()];
        assert_eq!(RunFingerprint::of(&base), RunFingerprint::of(&other));
    }

    #[test]
    fn test_each_core_key_changes_fingerprint() {
        let base = sample();
        let base_fp = RunFingerprint::of(&base);
        let variants: Vec<Box<dyn Fn(&mut TrainingConfig)>> = vec![
            Box::new(|c| c.lr = 0.0001),
            Box::new(|c| c.batch_size = 64),
            Box::new(|c| c.latent_dim = 128),
            Box::new(|c| c.ngf = 32),
            Box::new(|c| c.ndf = 32),
        ];
        for mutate in variants {
            let mut changed = base.clone();
            mutate(&mut changed);
            assert_ne!(RunFingerprint::of(&changed).digest(), base_fp.digest());
        }
    }
}
