//! Stable fingerprints for cacheable prompt dispatches.
//!
//! The fingerprint is a SHA-256 over the canonical tuple
//! `(normalized_prompt, system_prompt, model_id, tier,
//! temperature_bucket, top_p_bucket, max_tokens_bucket)`. Sampling
//! parameters are bucketed so epsilon-different requests share an entry.

use sha2::{Digest, Sha256};

use maestro_types::{CompletionRequest, Tier};

/// A 32-byte prompt-dispatch fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint for a request at a tier.
    #[must_use]
    pub fn compute(request: &CompletionRequest, tier: Tier) -> Self {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, canonicalize(&request.prompt).as_bytes());
        update_field(
            &mut hasher,
            request.system.as_deref().unwrap_or_default().as_bytes(),
        );
        update_field(&mut hasher, request.model.as_bytes());
        update_field(&mut hasher, tier.to_string().as_bytes());
        update_field(&mut hasher, &bucket_2dp(request.temperature).to_le_bytes());
        update_field(&mut hasher, &bucket_2dp(request.top_p).to_le_bytes());
        update_field(&mut hasher, &bucket_256(request.max_tokens).to_le_bytes());
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Length-prefix each field so adjacent fields can never alias.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Canonical prompt form: trailing newlines stripped, every interior
/// run of whitespace collapsed to a single space. Idempotent.
#[must_use]
pub fn canonicalize(prompt: &str) -> String {
    let stripped = prompt.trim_end_matches('\n');
    let mut out = String::with_capacity(stripped.len());
    let mut in_whitespace = false;
    for ch in stripped.chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                out.push(' ');
            }
            in_whitespace = true;
        } else {
            out.push(ch);
            in_whitespace = false;
        }
    }
    out
}

/// Bucket a sampling parameter to two decimals; `None` maps to a
/// sentinel outside the valid range.
fn bucket_2dp(value: Option<f32>) -> i32 {
    match value {
        Some(v) => (v * 100.0).round() as i32,
        None => -1,
    }
}

/// Bucket max_tokens to the nearest 256.
fn bucket_256(max_tokens: u32) -> u32 {
    (max_tokens.saturating_add(128) / 256) * 256
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(prompt: &str) -> CompletionRequest {
        let mut r = CompletionRequest::new("m-cheap", prompt);
        r.temperature = Some(0.2);
        r
    }

    #[test]
    fn identical_requests_share_a_fingerprint() {
        let a = Fingerprint::compute(&request("hello world"), Tier::Cheap);
        let b = Fingerprint::compute(&request("hello world"), Tier::Cheap);
        assert_eq!(a, b);
    }

    #[test]
    fn whitespace_runs_and_trailing_newlines_are_insignificant() {
        let a = Fingerprint::compute(&request("hello   world\n\n"), Tier::Cheap);
        let b = Fingerprint::compute(&request("hello world"), Tier::Cheap);
        assert_eq!(a, b);
    }

    #[test]
    fn tier_and_model_are_significant() {
        let a = Fingerprint::compute(&request("hello"), Tier::Cheap);
        let b = Fingerprint::compute(&request("hello"), Tier::Capable);
        assert_ne!(a, b);

        let mut other_model = request("hello");
        other_model.model = "m-premium".into();
        let c = Fingerprint::compute(&other_model, Tier::Cheap);
        assert_ne!(a, c);
    }

    #[test]
    fn temperature_buckets_to_two_decimals() {
        let mut a = request("hello");
        a.temperature = Some(0.2001);
        let mut b = request("hello");
        b.temperature = Some(0.2049);
        let mut c = request("hello");
        c.temperature = Some(0.21);
        assert_eq!(
            Fingerprint::compute(&a, Tier::Cheap),
            Fingerprint::compute(&b, Tier::Cheap)
        );
        assert_ne!(
            Fingerprint::compute(&a, Tier::Cheap),
            Fingerprint::compute(&c, Tier::Cheap)
        );
    }

    #[test]
    fn max_tokens_buckets_to_256() {
        let mut a = request("hello");
        a.max_tokens = 1000;
        let mut b = request("hello");
        b.max_tokens = 1024;
        let mut c = request("hello");
        c.max_tokens = 2000;
        assert_eq!(
            Fingerprint::compute(&a, Tier::Cheap),
            Fingerprint::compute(&b, Tier::Cheap)
        );
        assert_ne!(
            Fingerprint::compute(&a, Tier::Cheap),
            Fingerprint::compute(&c, Tier::Cheap)
        );
    }

    #[test]
    fn display_is_lowercase_hex() {
        let fp = Fingerprint::compute(&request("hello"), Tier::Cheap);
        let hex = fp.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    /// Strings rich in whitespace variety, including newlines.
    fn whitespacey() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![Just(' '), Just('\n'), Just('\t'), any::<char>()],
            0..64,
        )
        .prop_map(|chars| chars.into_iter().collect())
    }

    proptest! {
        #[test]
        fn canonicalization_is_idempotent(prompt in whitespacey()) {
            let once = canonicalize(&prompt);
            let twice = canonicalize(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn canonical_form_has_no_runs_or_trailing_newlines(prompt in whitespacey()) {
            let canon = canonicalize(&prompt);
            prop_assert!(!canon.contains("  "));
            prop_assert!(!canon.ends_with('\n'));
        }

        #[test]
        fn fingerprint_is_stable_under_canonicalization(prompt in whitespacey()) {
            let raw = CompletionRequest::new("m", prompt.clone());
            let canon = CompletionRequest::new("m", canonicalize(&prompt));
            prop_assert_eq!(
                Fingerprint::compute(&raw, Tier::Cheap),
                Fingerprint::compute(&canon, Tier::Cheap)
            );
        }
    }
}
