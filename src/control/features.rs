//! Negotiation plan: which transport layers to install, in order.
//!
//! TLS always goes first so that compression runs inside the encrypted
//! channel. Compression modes are exclusive by construction
//! ([`CompressionMode`]).

use tracing::warn;

use super::identify::EndpointSettings;
use crate::codec::DEFAULT_DEFLATE_LEVEL;
use crate::config::{CompressionMode, FeatureOptions};
use crate::error::{NsqError, Result};

/// A transport layer to install after IDENTIFY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upgrade {
    /// Encrypting layer.
    Tls,
    /// Raw deflate at the negotiated level.
    Deflate { level: u32 },
    /// Snappy framing.
    Snappy,
}

/// Compare requested features with what the server granted.
///
/// Requested features that were not granted are skipped with a warning,
/// or fail with [`NsqError::FeatureFailure`] when `enforce` is set.
pub fn plan_upgrades(requested: &FeatureOptions, granted: &EndpointSettings) -> Result<Vec<Upgrade>> {
    let mut plan = Vec::new();

    if requested.tls.is_some() {
        if granted.tls_v1 {
            plan.push(Upgrade::Tls);
        } else {
            not_granted(requested, "tls_v1")?;
        }
    }

    match requested.compression {
        Some(CompressionMode::Deflate { level }) => {
            if granted.deflate {
                let mut level = granted.deflate_level.unwrap_or(level);
                if let Some(max) = granted.max_deflate_level {
                    level = level.min(max);
                }
                if level == 0 {
                    level = DEFAULT_DEFLATE_LEVEL;
                }
                plan.push(Upgrade::Deflate { level });
            } else {
                not_granted(requested, "deflate")?;
            }
        }
        Some(CompressionMode::Snappy) => {
            if granted.snappy {
                plan.push(Upgrade::Snappy);
            } else {
                not_granted(requested, "snappy")?;
            }
        }
        None => {}
    }

    Ok(plan)
}

fn not_granted(requested: &FeatureOptions, feature: &str) -> Result<()> {
    if requested.enforce {
        return Err(NsqError::FeatureFailure(format!(
            "{} requested but not granted by the server",
            feature
        )));
    }
    warn!(feature, "requested feature not granted, continuing without it");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsOptions;

    fn granted(tls: bool, deflate: bool, snappy: bool) -> EndpointSettings {
        EndpointSettings {
            tls_v1: tls,
            deflate,
            snappy,
            ..Default::default()
        }
    }

    #[test]
    fn test_tls_before_compression() {
        let requested = FeatureOptions {
            tls: Some(TlsOptions::default()),
            compression: Some(CompressionMode::Snappy),
            enforce: true,
        };
        let plan = plan_upgrades(&requested, &granted(true, false, true)).unwrap();
        assert_eq!(plan, vec![Upgrade::Tls, Upgrade::Snappy]);
    }

    #[test]
    fn test_deflate_level_capped_by_server() {
        let requested = FeatureOptions {
            compression: Some(CompressionMode::Deflate { level: 9 }),
            ..Default::default()
        };
        let settings = EndpointSettings {
            deflate: true,
            max_deflate_level: Some(6),
            ..Default::default()
        };
        assert_eq!(
            plan_upgrades(&requested, &settings).unwrap(),
            vec![Upgrade::Deflate { level: 6 }]
        );
    }

    #[test]
    fn test_missing_feature_skipped_without_enforce() {
        let requested = FeatureOptions {
            compression: Some(CompressionMode::Snappy),
            ..Default::default()
        };
        assert!(plan_upgrades(&requested, &granted(false, false, false))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_missing_feature_fails_with_enforce() {
        let requested = FeatureOptions {
            tls: Some(TlsOptions::default()),
            enforce: true,
            ..Default::default()
        };
        let err = plan_upgrades(&requested, &granted(false, false, false)).unwrap_err();
        assert!(matches!(err, NsqError::FeatureFailure(msg) if msg.contains("tls_v1")));
    }

    #[test]
    fn test_nothing_requested() {
        let plan = plan_upgrades(&FeatureOptions::default(), &granted(true, true, true)).unwrap();
        assert!(plan.is_empty());
    }
}
