pub mod redact;

pub use redact::{RedactedString, SecretKind, SecretRedactor};
