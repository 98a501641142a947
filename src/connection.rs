//! Connection descriptor parsing.
//!
//! Descriptors are semicolon-separated `key=value` pairs, consumed once at
//! startup: `DefaultEndpointsProtocol`, `AccountName`, `AccountKey`,
//! `TableEndpoint`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Result, TableError};

/// The well-known local emulator descriptor (devstoreaccount1).
pub const EMULATOR_CONNECTION_STRING: &str = "DefaultEndpointsProtocol=http;AccountName=devstoreaccount1;AccountKey=Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==;TableEndpoint=http://127.0.0.1:10002/devstoreaccount1;";

/// A parsed connection descriptor, bound to one storage account.
#[derive(Debug, Clone)]
pub struct ConnectionString {
    pub protocol: String,
    pub account_name: String,
    pub account_key: String,
    pub table_endpoint: String,
}

impl ConnectionString {
    /// Parse a descriptor. Missing or malformed fields fail with `Config`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut protocol = String::new();
        let mut account_name = String::new();
        let mut account_key = String::new();
        let mut table_endpoint = String::new();

        for part in raw.split(';') {
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                TableError::Config(format!("malformed segment in connection string: {}", part))
            })?;
            match key {
                "DefaultEndpointsProtocol" => protocol = value.to_string(),
                "AccountName" => account_name = value.to_string(),
                // The account key is base64 and may itself contain '='.
                "AccountKey" => account_key = part["AccountKey=".len()..].to_string(),
                "TableEndpoint" => table_endpoint = value.to_string(),
                _ => {}
            }
        }

        if account_name.is_empty() {
            return Err(TableError::Config("connection string is missing AccountName".into()));
        }
        if account_key.is_empty() {
            return Err(TableError::Config("connection string is missing AccountKey".into()));
        }
        if BASE64.decode(&account_key).is_err() {
            return Err(TableError::Config("AccountKey is not valid base64".into()));
        }
        if protocol.is_empty() {
            protocol = "https".to_string();
        }
        if table_endpoint.is_empty() {
            // Cloud accounts can omit the endpoint; derive the default one.
            table_endpoint = format!("{}://{}.table.core.windows.net", protocol, account_name);
        }

        Ok(Self {
            protocol,
            account_name,
            account_key,
            table_endpoint: table_endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Decode the account key for request signing.
    pub fn decoded_key(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.account_key)
            .map_err(|_| TableError::Config("AccountKey is not valid base64".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_emulator_descriptor() {
        let conn = ConnectionString::parse(EMULATOR_CONNECTION_STRING).unwrap();
        assert_eq!(conn.protocol, "http");
        assert_eq!(conn.account_name, "devstoreaccount1");
        assert_eq!(conn.table_endpoint, "http://127.0.0.1:10002/devstoreaccount1");
        assert!(conn.decoded_key().is_ok());
    }

    #[test]
    fn account_key_keeps_base64_padding() {
        let conn = ConnectionString::parse(EMULATOR_CONNECTION_STRING).unwrap();
        assert!(conn.account_key.ends_with("=="));
    }

    #[test]
    fn missing_account_name_is_a_config_error() {
        let err = ConnectionString::parse("AccountKey=QUJD;TableEndpoint=http://x").unwrap_err();
        assert!(matches!(err, TableError::Config(_)));
    }

    #[test]
    fn malformed_segment_is_a_config_error() {
        let err = ConnectionString::parse("AccountName=a;garbage;AccountKey=QUJD").unwrap_err();
        assert!(matches!(err, TableError::Config(_)));
    }

    #[test]
    fn bad_base64_key_is_a_config_error() {
        let err = ConnectionString::parse("AccountName=a;AccountKey=!!!").unwrap_err();
        assert!(matches!(err, TableError::Config(_)));
    }

    #[test]
    fn derives_cloud_endpoint_when_absent() {
        let conn = ConnectionString::parse("AccountName=acct;AccountKey=QUJD").unwrap();
        assert_eq!(conn.table_endpoint, "https://acct.table.core.windows.net");
    }
}
