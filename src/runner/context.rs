use crate::parser::types::TestConfig;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([a-zA-Z0-9_.]+)\}").expect("valid placeholder regex"))
}

/// Per-test runtime state, owned by one executor for one run
#[derive(Debug)]
pub struct TestContext {
    /// Application id from the test header or global config
    pub app_id: Option<String>,

    /// Values for `${name}` placeholders
    pub vars: HashMap<String, String>,

    /// Cached screen dimensions; cleared when the foreground app changes
    screen_size: Option<(u32, u32)>,

    pub started_at: Instant,
}

impl Default for TestContext {
    fn default() -> Self {
        Self {
            app_id: None,
            vars: HashMap::new(),
            screen_size: None,
            started_at: Instant::now(),
        }
    }
}

impl TestContext {
    /// Fresh context for a test, seeded from its header
    pub fn for_test(config: &TestConfig, default_app: Option<&str>) -> Self {
        Self {
            app_id: config
                .app
                .clone()
                .or_else(|| default_app.map(str::to_string)),
            vars: config.vars.clone(),
            ..Default::default()
        }
    }

    pub fn screen_size(&self) -> Option<(u32, u32)> {
        self.screen_size
    }

    pub fn cache_screen_size(&mut self, size: (u32, u32)) {
        self.screen_size = Some(size);
    }

    pub fn invalidate_screen_size(&mut self) {
        self.screen_size = None;
    }

    /// Look up a variable: test vars first, then the process environment
    pub fn get_var(&self, name: &str) -> Option<String> {
        self.vars
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    /// Substitute `${name}` placeholders. Unknown names are left as written.
    pub fn substitute_vars(&self, text: &str) -> String {
        var_re()
            .replace_all(text, |caps: &regex::Captures| {
                let key = &caps[1];
                if let Some(val) = self.get_var(key) {
                    return val;
                }
                match key {
                    "time" => chrono::Local::now().format("%H:%M:%S").to_string(),
                    "date" => chrono::Local::now().format("%Y-%m-%d").to_string(),
                    "timestamp" => chrono::Utc::now().timestamp().to_string(),
                    _ => {
                        log::warn!("Unresolved variable ${{{}}}", key);
                        caps[0].to_string()
                    }
                }
            })
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_vars() {
        let mut config = TestConfig::default();
        config.vars.insert("email".into(), "qa@example.com".into());
        let ctx = TestContext::for_test(&config, None);

        assert_eq!(
            ctx.substitute_vars("login ${email} now"),
            "login qa@example.com now"
        );
        assert_eq!(
            ctx.substitute_vars("${mut_surely_unset_var_42}"),
            "${mut_surely_unset_var_42}"
        );
        let date = ctx.substitute_vars("${date}");
        assert_eq!(date.len(), 10);
    }

    #[test]
    fn test_app_id_falls_back_to_default() {
        let ctx = TestContext::for_test(&TestConfig::default(), Some("com.example"));
        assert_eq!(ctx.app_id.as_deref(), Some("com.example"));

        let config = TestConfig {
            app: Some("com.other".into()),
            ..Default::default()
        };
        let ctx = TestContext::for_test(&config, Some("com.example"));
        assert_eq!(ctx.app_id.as_deref(), Some("com.other"));
    }

    #[test]
    fn test_screen_size_cache() {
        let mut ctx = TestContext::default();
        assert_eq!(ctx.screen_size(), None);
        ctx.cache_screen_size((1080, 2400));
        assert_eq!(ctx.screen_size(), Some((1080, 2400)));
        ctx.invalidate_screen_size();
        assert_eq!(ctx.screen_size(), None);
    }
}
