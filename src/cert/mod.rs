//! SNI 证书解析：证书缓存、解析器与签发者（自签名、ACME）

pub mod acme;
pub mod cache;
pub mod issuer;
pub mod resolver;

pub use acme::{AcmeConfig, AcmeIssuer, Http01Challenges, ACME_CHALLENGE_PREFIX};
pub use cache::{CertificateCache, DEFAULT_CERT_CAPACITY};
pub use issuer::{generate_self_signed, Issuer, SelfSignedIssuer, DEFAULT_VALIDITY};
pub use resolver::CertificateResolver;
