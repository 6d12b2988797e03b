use std::time::Duration;

const DAY: u64 = 24 * 60 * 60;

/// The default CA validity time span of twenty years (including leap days).
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs((20 * 365 + 5) * DAY);

/// The default validity of leaf certificates signed by the authority, five
/// years. It is clamped to the validity of the CA.
pub const DEFAULT_CERTIFICATE_VALIDITY: Duration = Duration::from_secs((5 * 365 + 1) * DAY);

/// Certificates become valid this long before their creation, so that peers
/// with slightly skewed clocks accept them.
pub const CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(15 * 60);

/// The serial number of every root CA.
pub const ROOT_CA_SERIAL: u64 = 1;

/// The default root CA subject.
pub const ZTLS_ROOT_CA_SUBJECT: &str =
    "CN=ztls,OU=IT,O=ztls Self Signed Certificates,L=Sao Paulo,ST=Sao Paulo,C=BR";
