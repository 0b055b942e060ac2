//! Paths and headers of the certificate-bootstrap HTTP exchange, shared by
//! the operator's API server and the agent-side client.

pub const URL_GET_CA: &str = "/api/ca-cert";
pub const URL_SIGN_CERT: &str = "/api/sign-cert";
pub const URL_UPDATE_ENDPOINTS: &str = "/api/endpoints";

pub const BEARER_PREFIX: &str = "Bearer ";
