// Shared size constants for the data model
// These mirror the consensus-layer object sizes and never change

// BLS12-381 public key, as registered by node operators
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
// BLS12-381 signature attached to every deposit
pub const BLS_SIGNATURE_SIZE: usize = 96;
// EVM word / block hash / withdrawal credentials
pub const HASH_SIZE: usize = 32;
// EL account address
pub const ADDRESS_SIZE: usize = 20;

// Default bind address for the health/metrics HTTP server
// Localhost only; expose via --port / PORT explicitly
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
