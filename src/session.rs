//! Keys used in the cookie session.

pub const IDENTITY: &str = "identity";
