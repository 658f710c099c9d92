//! Config serialization to TOML
//!
//! Used by `chatbridge config --show`. Credentials are replaced with their
//! fingerprint, so the output is safe to paste into a bug report.

use super::Config;

/// TOML string literal with escaping
fn quote(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}

fn string_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
    format!("[{}]", quoted.join(", "))
}

impl Config {
    /// Serialize the effective configuration, credentials redacted
    pub fn to_toml(&self) -> String {
        let mut out = String::new();

        out.push_str("# chatbridge effective configuration (credentials redacted)\n\n");
        out.push_str(&format!("bind_addr = {}\n\n", quote(&self.bind_addr.to_string())));

        out.push_str("[upstream]\n");
        match &self.upstream.base_url {
            Some(url) => out.push_str(&format!("base_url = {}\n", quote(url))),
            None => out.push_str("# base_url = \"https://upstream.example/v1\"\n"),
        }
        out.push_str(&format!(
            "connect_timeout_secs = {}\nread_timeout_secs = {}\nmax_connections = {}\nmax_idle_connections = {}\n\n",
            self.upstream.connect_timeout_secs,
            self.upstream.read_timeout_secs,
            self.upstream.max_connections,
            self.upstream.max_idle_connections,
        ));

        out.push_str("[models]\n");
        if self.models.is_empty() {
            out.push_str("# \"my-model\" = \"app-...\"\n");
        }
        for (name, credential) in self.models.iter() {
            out.push_str(&format!(
                "{} = {}\n",
                quote(name),
                quote(&format!("<redacted sha256:{}>", credential.fingerprint()))
            ));
        }
        out.push('\n');

        let store = &self.store;
        out.push_str("[store]\n");
        out.push_str(&format!(
            "db_path = {}\n",
            quote(&store.db_path.display().to_string())
        ));
        out.push_str(&format!(
            "busy_timeout_ms = {}\nmax_attempts = {}\nbase_delay_ms = {}\nmax_delay_ms = {}\npool_size = {}\n",
            store.busy_timeout_ms,
            store.max_attempts,
            store.base_delay_ms,
            store.max_delay_ms,
            store.pool_size,
        ));
        out.push_str(&format!(
            "mapping_policy = {}\nretention_days = {}\nsweep_interval_secs = {}\n\n",
            quote(store.mapping_policy.as_str()),
            store.retention_days,
            store.sweep_interval_secs,
        ));

        let identity = &self.identity;
        out.push_str("[identity]\n");
        out.push_str(&format!("default_user = {}\n", quote(&identity.default_user)));
        out.push_str(&format!(
            "session_headers = {}\n",
            string_list(&identity.session_headers)
        ));
        out.push_str(&format!(
            "session_markers = {}\n",
            string_list(&identity.session_markers)
        ));
        out.push_str(&format!("user_headers = {}\n", string_list(&identity.user_headers)));
        out.push_str(&format!("user_markers = {}\n\n", string_list(&identity.user_markers)));

        out.push_str("[pacing]\n");
        let tiers: Vec<String> = self
            .pacing
            .tiers
            .iter()
            .map(|t| format!("{{ above = {}, delay_ms = {} }}", t.above, t.delay_ms))
            .collect();
        out.push_str(&format!("tiers = [{}]\n", tiers.join(", ")));
        out.push_str(&format!(
            "ceiling_ms = {}\nfloor_ms = {}\n\n",
            self.pacing.ceiling_ms, self.pacing.floor_ms
        ));

        let logging = &self.logging;
        out.push_str("[logging]\n");
        out.push_str(&format!("level = {}\n", quote(&logging.level)));
        out.push_str(&format!("file_enabled = {}\n", logging.file_enabled));
        out.push_str(&format!(
            "file_dir = {}\n",
            quote(&logging.file_dir.display().to_string())
        ));
        out.push_str(&format!(
            "file_rotation = {}\n",
            quote(logging.file_rotation.as_str())
        ));
        out.push_str(&format!("file_prefix = {}\n", quote(&logging.file_prefix)));

        out
    }
}
