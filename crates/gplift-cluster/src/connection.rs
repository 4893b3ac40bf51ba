//! Connection settings for a cluster's coordinator.
//!
//! One builder serves every caller: pick the version and port, then opt into
//! utility mode or system-table modification.

use semver::Version;

/// Database every catalog connection opens.
pub const DEFAULT_DATABASE: &str = "template1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub version: Version,
    pub port: u16,
    pub utility_mode: bool,
    pub allow_system_table_mods: bool,
}

impl ConnectionConfig {
    pub fn new(version: Version, port: u16) -> Self {
        Self {
            version,
            port,
            utility_mode: false,
            allow_system_table_mods: false,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn utility_mode(mut self) -> Self {
        self.utility_mode = true;
        self
    }

    pub fn allow_system_table_mods(mut self) -> Self {
        self.allow_system_table_mods = true;
        self
    }

    /// Session parameters implied by the options, in URI order.
    ///
    /// `search_path` is always present and empty so that no default schema
    /// is resolved. The utility-mode parameter was renamed in 7.0.
    pub fn session_parameters(&self) -> Vec<(&'static str, &'static str)> {
        let mut params = vec![("search_path", "")];
        if self.utility_mode {
            let name = if self.version.major >= 7 {
                "gp_role"
            } else {
                "gp_session_role"
            };
            params.push((name, "utility"));
        }
        if self.allow_system_table_mods {
            params.push(("allow_system_table_mods", "true"));
        }
        params
    }

    pub fn uri(&self) -> String {
        let query: Vec<String> = self
            .session_parameters()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!(
            "postgresql://localhost:{}/{DEFAULT_DATABASE}?{}",
            self.port,
            query.join("&")
        )
    }

    /// Driver configuration carrying the same parameters as [`uri`](Self::uri),
    /// passed as `-c name=value` startup options.
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let options: Vec<String> = self
            .session_parameters()
            .iter()
            .map(|(k, v)| format!("-c {k}={v}"))
            .collect();

        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_else(|_| "gpadmin".to_string());

        let mut config = tokio_postgres::Config::new();
        config
            .host("localhost")
            .port(self.port)
            .dbname(DEFAULT_DATABASE)
            .user(&user)
            .options(&options.join(" "));
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v7_utility_mode_uses_gp_role() {
        let uri = ConnectionConfig::new(Version::new(7, 0, 0), 5432)
            .port(1234)
            .utility_mode()
            .uri();
        assert_eq!(
            uri,
            "postgresql://localhost:1234/template1?search_path=&gp_role=utility"
        );
    }

    #[test]
    fn v5_utility_mode_uses_gp_session_role() {
        let uri = ConnectionConfig::new(Version::new(5, 29, 1), 15432)
            .utility_mode()
            .uri();
        assert_eq!(
            uri,
            "postgresql://localhost:15432/template1?search_path=&gp_session_role=utility"
        );
    }

    #[test]
    fn v6_utility_mode_uses_gp_session_role() {
        let uri = ConnectionConfig::new(Version::new(6, 99, 0), 1).utility_mode().uri();
        assert!(uri.ends_with("&gp_session_role=utility"));
    }

    #[test]
    fn default_connection_has_empty_search_path_only() {
        let uri = ConnectionConfig::new(Version::new(6, 20, 0), 5432).uri();
        assert_eq!(uri, "postgresql://localhost:5432/template1?search_path=");
    }

    #[test]
    fn allow_system_table_mods_is_appended_last() {
        let uri = ConnectionConfig::new(Version::new(7, 1, 0), 5432)
            .allow_system_table_mods()
            .utility_mode()
            .uri();
        assert_eq!(
            uri,
            "postgresql://localhost:5432/template1?search_path=&gp_role=utility&allow_system_table_mods=true"
        );
    }

    #[test]
    fn pg_config_carries_port_and_options() {
        let config = ConnectionConfig::new(Version::new(7, 0, 0), 6000)
            .utility_mode()
            .to_pg_config();
        assert_eq!(config.get_ports(), &[6000]);
        assert_eq!(config.get_dbname(), Some("template1"));
        assert_eq!(
            config.get_options(),
            Some("-c search_path= -c gp_role=utility")
        );
    }
}
