//! Block signature matching.
//!
//! A response is "blocked" when the origin refused or rate-limited us rather
//! than serving the listing: a refusal status code, an anomalously small
//! body, or an interstitial/captcha marker in the body.

use changewatch_shared::BlockSignatureSet;

/// Which part of the block signature set matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Status(u16),
    UndersizedBody { len: usize, min: usize },
    Marker(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(code) => write!(f, "blocked status HTTP {code}"),
            Self::UndersizedBody { len, min } => {
                write!(f, "anomalous body size {len} bytes (< {min})")
            }
            Self::Marker(m) => write!(f, "interstitial marker '{m}'"),
        }
    }
}

/// Check the status code against the refusal set.
pub fn status_blocked(status: u16, signatures: &BlockSignatureSet) -> Option<BlockReason> {
    signatures
        .status_codes
        .contains(&status)
        .then_some(BlockReason::Status(status))
}

/// Check a successful body for size anomalies and interstitial markers.
pub fn body_blocked(body: &str, signatures: &BlockSignatureSet) -> Option<BlockReason> {
    if body.len() < signatures.min_body_bytes {
        return Some(BlockReason::UndersizedBody {
            len: body.len(),
            min: signatures.min_body_bytes,
        });
    }

    let haystack = body.to_lowercase();
    signatures
        .body_markers
        .iter()
        .find(|m| !m.is_empty() && haystack.contains(&m.to_lowercase()))
        .map(|m| BlockReason::Marker(m.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(inner: &str) -> String {
        format!("<html><body>{inner}{}</body></html>", " ".repeat(400))
    }

    #[test]
    fn refusal_status_codes() {
        let sigs = BlockSignatureSet::default();
        assert_eq!(status_blocked(429, &sigs), Some(BlockReason::Status(429)));
        assert_eq!(status_blocked(403, &sigs), Some(BlockReason::Status(403)));
        assert_eq!(status_blocked(200, &sigs), None);
        assert_eq!(status_blocked(404, &sigs), None);
    }

    #[test]
    fn tiny_body_is_blocked() {
        let sigs = BlockSignatureSet::default();
        let reason = body_blocked("<html></html>", &sigs).unwrap();
        assert!(matches!(reason, BlockReason::UndersizedBody { len: 13, .. }));
    }

    #[test]
    fn marker_match_is_case_insensitive() {
        let sigs = BlockSignatureSet::default();
        let body = padded("<p>Please Verify You Are Human</p>");
        assert_eq!(
            body_blocked(&body, &sigs),
            Some(BlockReason::Marker("verify you are human".into()))
        );
    }

    #[test]
    fn normal_body_passes() {
        let sigs = BlockSignatureSet::default();
        let body = padded("<ul><li><a href='/posts/1'>One</a></li></ul>");
        assert_eq!(body_blocked(&body, &sigs), None);
    }

    #[test]
    fn form_captcha_on_listing_passes() {
        let sigs = BlockSignatureSet::default();
        let body = padded(
            r#"<ul><li><a href='/posts/1'>One</a></li></ul>
            <form class="newsletter"><div class="g-recaptcha" data-sitekey="x"></div></form>
            <form class="comments"><div class="h-captcha" data-sitekey="y"></div></form>"#,
        );
        assert_eq!(body_blocked(&body, &sigs), None);
    }

    #[test]
    fn reason_display() {
        assert_eq!(BlockReason::Status(503).to_string(), "blocked status HTTP 503");
    }
}
