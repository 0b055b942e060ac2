use std::collections::BTreeMap;

const ENV_PREFIX: &str = "AGENT_ARG_";
const LOG_LEVEL_KEY: &str = "log-level";

/// Command-line arguments for the edge agent, keyed by long flag name.
///
/// Environment variables prefixed `AGENT_ARG_` are converted into entries by
/// stripping the prefix, lowercasing, and replacing `_` with `-`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentArgumentMap(BTreeMap<String, String>);

// === impl AgentArgumentMap ===

impl AgentArgumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let entries = std::env::vars()
            .filter_map(|(key, value)| {
                let key = key.strip_prefix(ENV_PREFIX)?;
                Some((key.to_lowercase().replace('_', "-"), value))
            })
            .collect();
        Self(entries)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) {
        self.0.remove(key);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True only on the literal string "true".
    pub fn is_ipam_enabled(&self) -> bool {
        self.get("enable-ipam") == "true"
    }

    /// True only on the literal string "true".
    pub fn is_proxy_enabled(&self) -> bool {
        self.get("enable-proxy") == "true"
    }

    /// Renders `--<key>=<value>` flags sorted by key, except that `log-level`
    /// is rendered as the shorthand `--v=<level>` and always placed last.
    pub fn argument_array(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len());
        for (key, value) in &self.0 {
            if key == LOG_LEVEL_KEY {
                continue;
            }
            args.push(format!("--{key}={value}"));
        }
        if let Some(level) = self.0.get(LOG_LEVEL_KEY) {
            args.push(format!("--v={level}"));
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let mut args = AgentArgumentMap::new();
        assert!(!args.has_key("hello"));
        assert_eq!(args.get("hello"), "");

        args.set("hello", "world");
        assert!(args.has_key("hello"));
        assert_eq!(args.get("hello"), "world");

        args.delete("hello");
        assert!(!args.has_key("hello"));
        assert_eq!(args.get("hello"), "");
    }

    #[test]
    fn boolean_flags_require_the_literal_true() {
        let mut args = AgentArgumentMap::new();
        args.set("enable-ipam", "");
        args.set("enable-proxy", "TRUE");
        assert!(!args.is_ipam_enabled());
        assert!(!args.is_proxy_enabled());

        args.set("enable-ipam", "true");
        args.set("enable-proxy", "true");
        assert!(args.is_ipam_enabled());
        assert!(args.is_proxy_enabled());
    }

    #[test]
    fn argument_array_is_sorted_by_flag_name() {
        let mut args = AgentArgumentMap::new();
        args.set("enable-proxy", "false");
        args.set("enable-ipam", "true");
        assert_eq!(
            args.argument_array(),
            vec!["--enable-ipam=true", "--enable-proxy=false"],
        );
    }

    #[test]
    fn log_level_renders_as_v_and_goes_last() {
        let mut args = AgentArgumentMap::new();
        args.set("log-level", "3");
        args.set("enable-ipam", "true");
        args.set("enable-proxy", "false");
        assert_eq!(
            args.argument_array(),
            vec!["--enable-ipam=true", "--enable-proxy=false", "--v=3"],
        );
    }

    #[test]
    fn from_env_strips_and_rewrites_keys() {
        std::env::set_var("AGENT_ARG_LOG_LEVEL", "3");
        std::env::set_var("AGENT_ARG_ENABLE_IPAM", "true");
        std::env::set_var("AGENT_ARG_ENABLE_PROXY", "");

        let args = AgentArgumentMap::from_env();
        assert_eq!(args.get(LOG_LEVEL_KEY), "3");
        assert!(args.is_ipam_enabled());
        assert!(!args.is_proxy_enabled());
        assert!(args.len() >= 3);

        std::env::remove_var("AGENT_ARG_LOG_LEVEL");
        std::env::remove_var("AGENT_ARG_ENABLE_IPAM");
        std::env::remove_var("AGENT_ARG_ENABLE_PROXY");
    }
}
