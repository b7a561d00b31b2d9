//! # contactgate
//!
//! Contact form service that only accepts a submission once the sender proves
//! control of the email address with a one-time code.
//!
//! A submit request holds the form in a verification session and emails a
//! numeric code. Verifying the code consumes it exactly once, records the
//! submission and notifies the configured recipient.
//!
//! Codes, resend cooldowns, sessions and rate-limit counters live in an
//! [`store::EphemeralStore`]. Redis is the shared backend; when it is absent
//! or unreachable every operation continues against an in-process map.

pub mod api;
pub mod cli;
pub mod flow;
pub mod mailer;
pub mod metrics;
pub mod otp;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod submissions;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }
}
