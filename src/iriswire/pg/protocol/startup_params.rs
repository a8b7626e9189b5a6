use fnv::FnvHashMap;

use crate::iriswire::{Error, Result};

/// The key/value parameters from a StartupMessage. Keys observed in the
/// wild: user, database, application_name, client_encoding, options.
#[derive(Debug, Default, Clone)]
pub struct StartupParams {
    params: FnvHashMap<String, String>,
}

impl StartupParams {
    /// Parse the NUL-terminated key/value pairs following the protocol
    /// version in a StartupMessage body.
    pub fn parse(mut body: &[u8]) -> Result<Self> {
        let mut params = FnvHashMap::default();
        loop {
            match memchr::memchr(0, body) {
                None => break,
                Some(0) => break, // terminating NUL
                Some(i) => {
                    let key = std::str::from_utf8(&body[..i])?.to_string();
                    body = &body[i + 1..];
                    let j = memchr::memchr(0, body).ok_or_else(|| {
                        Error::protocol_error("startup parameter value missing terminator")
                    })?;
                    let value = std::str::from_utf8(&body[..j])?.to_string();
                    body = &body[j + 1..];
                    params.insert(key, value);
                }
            }
        }
        if !params.contains_key("user") {
            return Err(Error::protocol_error("startup message missing user"));
        }
        Ok(StartupParams { params })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn user(&self) -> &str {
        self.get("user").unwrap_or_default()
    }

    pub fn database(&self) -> &str {
        // Postgres defaults the database to the user name
        self.get("database").unwrap_or_else(|| self.user())
    }

    pub fn application_name(&self) -> &str {
        self.get("application_name").unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_startup_params() {
        let body = b"user\0alice\0database\0USER\0application_name\0psql\0\0";
        let params = StartupParams::parse(body).unwrap();
        assert_eq!(params.user(), "alice");
        assert_eq!(params.database(), "USER");
        assert_eq!(params.application_name(), "psql");
    }

    #[test]
    fn test_database_defaults_to_user() {
        let body = b"user\0bob\0\0";
        let params = StartupParams::parse(body).unwrap();
        assert_eq!(params.database(), "bob");
    }

    #[test]
    fn test_missing_user_is_an_error() {
        let body = b"database\0USER\0\0";
        assert!(StartupParams::parse(body).is_err());
    }
}
