//! Runtime facts of a started jail, as reported by `jls --libxo=json`.

use serde::{Deserialize, Deserializer, Serialize};

use jailforge_common::{ForgeError, ForgeResult};

/// Facts about a running jail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailInfo {
    /// Jail id.
    pub jid: u32,
    /// Jail name.
    #[serde(default)]
    pub name: String,
    /// Root directory.
    #[serde(default)]
    pub path: String,
    /// Hostname inside the jail.
    #[serde(rename = "host.hostname", default)]
    pub hostname: String,
    /// IPv4 addresses.
    #[serde(rename = "ip4.addr", default, deserialize_with = "addresses")]
    pub ip4: Vec<String>,
}

#[derive(Deserialize)]
struct JlsOutput {
    #[serde(rename = "jail-information")]
    information: JlsInformation,
}

#[derive(Deserialize)]
struct JlsInformation {
    #[serde(default)]
    jail: Vec<JailInfo>,
}

impl JailInfo {
    /// Parse `jls -j <name> -n --libxo=json` output.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the document is malformed, or `JailNotFound`
    /// if it lists no jail.
    pub fn from_jls(json: &str, name: &str) -> ForgeResult<Self> {
        let output: JlsOutput = serde_json::from_str(json)?;
        output
            .information
            .jail
            .into_iter()
            .next()
            .ok_or_else(|| ForgeError::JailNotFound {
                name: name.to_string(),
            })
    }

    /// First IPv4 address, if any.
    #[must_use]
    pub fn primary_ip4(&self) -> Option<&str> {
        self.ip4.first().map(String::as_str)
    }
}

/// `ip4.addr` is a string (possibly comma separated) or a list of strings.
fn addresses<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Addresses {
        One(String),
        Many(Vec<String>),
    }

    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty() && *a != "-")
            .map(str::to_string)
            .collect()
    };

    Ok(match Option::<Addresses>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Addresses::One(s)) => split(&s),
        Some(Addresses::Many(list)) => list.iter().flat_map(|s| split(s)).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_addresses() {
        let json = r#"{"__version": "2", "jail-information": {"jail": [
            {"jid": 4, "name": "web", "path": "/jails/web", "host.hostname": "web.local",
             "ip4.addr": ["10.0.0.2", "10.0.0.3"], "persist": false}
        ]}}"#;
        let info = JailInfo::from_jls(json, "web").unwrap();
        assert_eq!(info.jid, 4);
        assert_eq!(info.hostname, "web.local");
        assert_eq!(info.ip4, vec!["10.0.0.2", "10.0.0.3"]);
        assert_eq!(info.primary_ip4(), Some("10.0.0.2"));
    }

    #[test]
    fn parses_string_and_missing_addresses() {
        let json = r#"{"jail-information": {"jail": [{"jid": 1, "ip4.addr": "10.1.1.1,10.1.1.2"}]}}"#;
        let info = JailInfo::from_jls(json, "a").unwrap();
        assert_eq!(info.ip4, vec!["10.1.1.1", "10.1.1.2"]);

        let json = r#"{"jail-information": {"jail": [{"jid": 2, "ip4.addr": "-"}]}}"#;
        assert!(JailInfo::from_jls(json, "b").unwrap().ip4.is_empty());

        let json = r#"{"jail-information": {"jail": [{"jid": 3}]}}"#;
        assert_eq!(JailInfo::from_jls(json, "c").unwrap().primary_ip4(), None);
    }

    #[test]
    fn empty_listing_is_not_found() {
        let err = JailInfo::from_jls(r#"{"jail-information": {"jail": []}}"#, "gone").unwrap_err();
        assert!(matches!(err, ForgeError::JailNotFound { ref name } if name == "gone"));
        assert!(matches!(
            JailInfo::from_jls("not json", "x"),
            Err(ForgeError::Serialization(_))
        ));
    }
}
