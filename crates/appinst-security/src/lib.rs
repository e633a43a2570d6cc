mod checksum;
mod ed25519;
mod validator;

pub use checksum::{reference_digest, reference_lines, sha256_hex, sha256_hex_file};
pub use ed25519::PublicKey;
pub use validator::{
    CertificateBundle, CertificateInfo, PolicyValidator, SignatureEntry, SignatureError,
    SignatureFile, SignatureOutcome, SignaturePolicy, SignatureRole, SignatureValidator,
    SIGNATURE_FILE_NAME,
};
