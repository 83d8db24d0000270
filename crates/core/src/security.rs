pub mod encryption;
pub mod kms;

pub use encryption::EncryptionService;
pub use kms::{HttpKmsClient, KmsClient, LocalKmsClient};
