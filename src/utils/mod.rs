pub mod fingerprint;
pub mod hash;
pub mod token;
pub mod validation;
