//! Origin signing seam.
//!
//! The pipeline only knows that a matched pattern may carry an auth
//! descriptor and that a signer must then be invoked on the origin URL.
//! The signer itself is a black box behind this trait.

use crate::error::Result;
use crate::routing::PatternAuth;

pub trait OriginSigner: Send + Sync {
    /// Sign an origin URL according to the pattern's auth descriptor,
    /// returning the URL to fetch.
    fn sign(&self, url: &str, auth: &PatternAuth) -> Result<String>;
}

/// Signer that returns the URL unchanged. Used when no signing backend is
/// wired in.
pub struct NoopSigner;

impl OriginSigner for NoopSigner {
    fn sign(&self, url: &str, _auth: &PatternAuth) -> Result<String> {
        Ok(url.to_string())
    }
}

/// Sign `url` when the auth descriptor is present, else pass it through.
pub fn sign_if_required(
    signer: &dyn OriginSigner,
    url: &str,
    auth: Option<&PatternAuth>,
) -> Result<String> {
    match auth {
        Some(auth) => signer.sign(url, auth),
        None => Ok(url.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_signer_passes_through() {
        let signed = sign_if_required(
            &NoopSigner,
            "https://bucket.s3.amazonaws.com/a.mp4",
            Some(&PatternAuth::AwsS3PresignedUrl),
        )
        .unwrap();
        assert_eq!(signed, "https://bucket.s3.amazonaws.com/a.mp4");
    }

    #[test]
    fn test_no_auth_skips_signer() {
        struct PanickySigner;
        impl OriginSigner for PanickySigner {
            fn sign(&self, _url: &str, _auth: &PatternAuth) -> Result<String> {
                panic!("signer must not run without an auth descriptor");
            }
        }
        let signed = sign_if_required(&PanickySigner, "https://o.example.com/a.mp4", None).unwrap();
        assert_eq!(signed, "https://o.example.com/a.mp4");
    }
}
