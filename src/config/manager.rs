//! Merging of configuration sources
// (c) 2024 Ross Younger

use super::{Configuration, BASE_CONFIG_FILENAME, ENV_PREFIX};

use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    value::{Dict, Map, Value},
    Figment, Metadata, Profile, Provider,
};
use serde::Deserialize;
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};
use struct_field_names_as_array::FieldNamesAsSlice;
use tabled::{settings::style::Style, Table, Tabled};
use tracing::{trace, warn};

/// Configuration files that may apply to the current user, lowest precedence first
fn config_file_paths() -> Vec<PathBuf> {
    let mut paths = vec![Path::new("/etc").join(BASE_CONFIG_FILENAME)];
    match dirs::home_dir() {
        Some(home) => paths.push(home.join(format!(".{BASE_CONFIG_FILENAME}"))),
        None => warn!("could not determine home directory; no user configuration file"),
    }
    paths
}

/// The hard-wired defaults, labelled as such for `--show-config`
struct Defaults;

impl Provider for Defaults {
    fn metadata(&self) -> Metadata {
        Metadata::named("default")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(Configuration::default()).data()
    }
}

/// Processes and merges all possible configuration sources.
///
/// In increasing order of precedence: hard-wired defaults, the system configuration file,
/// the user configuration file, `PATHGAUGE_*` environment variables, then anything
/// merged in by the caller (typically the command line).
///
/// To see which files apply for the current user, run `pathgauge --config-files`.
#[derive(Debug, Default)]
pub struct Manager {
    data: Figment,
}

impl Manager {
    /// Reads the configuration files appropriate to the current user, and the environment.
    ///
    /// Problems with a file (such as a syntax error) are not reported here, but by [`Manager::get`].
    #[must_use]
    pub fn new() -> Self {
        let mut manager = Self::without_files();
        for path in config_file_paths() {
            if path.exists() {
                manager.merge_toml_file(&path);
            } else {
                trace!("configuration file {} not present", path.display());
            }
        }
        manager.merge_provider(Env::prefixed(ENV_PREFIX));
        manager
    }

    /// Lists the configuration files that [`Manager::new`] consults for the current user.
    #[must_use]
    pub fn config_files() -> Vec<String> {
        config_file_paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }

    /// Defaults only; does not read files or the environment
    #[must_use]
    pub(crate) fn without_files() -> Self {
        Self {
            data: Figment::from(Defaults),
        }
    }

    /// Merges in a data set, which is some sort of [figment::Provider](https://docs.rs/figment/latest/figment/trait.Provider.html).
    ///
    /// Command-line settings arrive this way via [`super::Overrides`].
    pub fn merge_provider<T: Provider>(&mut self, provider: T) {
        // a provider that fails leaves the figment in an error state, which get() reports
        self.data = std::mem::take(&mut self.data).merge(provider);
    }

    /// Merges in a TOML file, which must exist
    pub fn merge_toml_file<P: AsRef<Path>>(&mut self, path: P) {
        self.merge_provider(Toml::file_exact(path.as_ref()));
    }

    /// Extracts the merged configuration.
    ///
    /// `T` is usually [Configuration].
    pub fn get<'de, T: Deserialize<'de>>(&self) -> Result<T, figment::Error> {
        self.data.extract::<T>()
    }

    /// Creates an ephemeral `Display`able table of the fields of `T`,
    /// showing each value and where it came from.
    #[must_use]
    pub fn to_display_adapter<T: FieldNamesAsSlice>(
        &self,
        warn_on_unused: bool,
    ) -> DisplayAdapter<'_> {
        DisplayAdapter {
            source: self,
            warn_on_unused,
            fields: T::FIELD_NAMES_AS_SLICE,
        }
    }
}

/// One line of `--show-config` output
#[derive(Tabled)]
struct ConfigRow {
    field: String,
    value: String,
    source: String,
}

fn describe_source(meta: Option<&Metadata>) -> String {
    meta.map(|m| {
        m.source
            .as_ref()
            .map_or_else(|| m.name.to_string(), ToString::to_string)
    })
    .unwrap_or_default()
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::String(_, s) => s.clone(),
        Value::Num(_, n) => n
            .to_i128()
            .map(|i| i.to_string())
            .or_else(|| n.to_f64().map(|f| f.to_string()))
            .unwrap_or_default(),
        Value::Bool(_, b) => b.to_string(),
        Value::Char(_, c) => c.to_string(),
        Value::Empty(..) => "<empty>".into(),
        // no setting is a table or list
        Value::Dict(..) | Value::Array(..) => "<compound>".into(),
    }
}

/// Pretty-printing wrapper for [`Manager`]
#[derive(Debug)]
pub struct DisplayAdapter<'a> {
    source: &'a Manager,
    /// Whether to complain about fields that nothing reads
    warn_on_unused: bool,
    fields: &'static [&'static str],
}

impl DisplayAdapter<'_> {
    /// Table rows, plus any complaints found along the way
    fn rows(&self) -> Result<(Vec<ConfigRow>, Vec<String>), figment::Error> {
        let figment = &self.source.data;
        let mut rows = Vec::new();
        let mut complaints = Vec::new();
        let data = figment.data()?;
        let Some(dict) = data.get(&Profile::Default) else {
            return Ok((rows, complaints));
        };
        for field in dict.keys() {
            let meta = figment.find_metadata(field);
            if !self.fields.contains(&field.as_str()) {
                if self.warn_on_unused {
                    complaints.push(format!(
                        "unrecognised field `{field}` in {}",
                        describe_source(meta)
                    ));
                }
                continue;
            }
            match figment.find_value(field) {
                Ok(value) => rows.push(ConfigRow {
                    field: field.clone(),
                    value: describe_value(&value),
                    source: describe_source(meta),
                }),
                Err(e) => complaints.push(format!("error on {field}: {e}")),
            }
        }
        Ok((rows, complaints))
    }
}

impl Display for DisplayAdapter<'_> {
    /// N.B. Complaints go to stderr, with CLI styling.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::cli::styles::{ERROR, WARNING};
        use anstream::eprintln;

        match self.rows() {
            Ok((rows, complaints)) => {
                for c in complaints {
                    eprintln!("{WARNING}WARNING{WARNING:#}: {c}");
                }
                write!(f, "{}", Table::new(rows).with(Style::sharp()))
            }
            Err(e) => {
                eprintln!("{ERROR}ERROR{ERROR:#} {e}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::config::{Configuration, Manager, Overrides};
    use crate::util::make_test_tempfile;
    use figment::providers::Env;

    #[test]
    fn defaults() {
        let mgr = Manager::without_files();
        assert_eq!(mgr.get::<Configuration>().unwrap(), Configuration::default());
    }

    #[test]
    fn config_files_listed() {
        let files = Manager::config_files();
        assert_eq!(files[0], "/etc/pathgauge.toml");
        if files.len() > 1 {
            assert!(files[1].ends_with(".pathgauge.toml"));
        }
    }

    #[test]
    fn command_line_beats_file() {
        let (path, _tempdir) = make_test_tempfile(
            r#"
            listen = "127.0.0.1:9000"
            initial_chunk_size = "128k"
            upload_duration = 4
        "#,
            "test.toml",
        );
        let mut mgr = Manager::without_files();
        mgr.merge_toml_file(path);
        mgr.merge_provider(Overrides {
            upload_duration: Some(7),
            max_connections: Some(12345),
            ..Default::default()
        });
        let result = mgr.get::<Configuration>().unwrap();
        assert_eq!(result.listen, "127.0.0.1:9000");
        assert_eq!(result.initial_chunk_size(), 128_000);
        assert_eq!(result.upload_duration, 7);
        assert_eq!(result.max_connections, 12345);
    }

    #[test]
    fn environment() {
        // Unique prefix, so as not to disturb other tests running in parallel
        std::env::set_var("PGTEST_ENV_MAX_CONNECTIONS", "17");
        std::env::set_var("PGTEST_ENV_INITIAL_CHUNK_SIZE", "1000k");
        let mut mgr = Manager::without_files();
        mgr.merge_provider(Env::prefixed("PGTEST_ENV_"));
        let result = mgr.get::<Configuration>().unwrap();
        assert_eq!(result.max_connections, 17);
        assert_eq!(result.initial_chunk_size(), 1_000_000);
    }

    #[test]
    fn show_config_sources() {
        let (path, _tempdir) = make_test_tempfile(
            r#"
            listen = "[::]:3001"
            unused__ = 42
        "#,
            "test.toml",
        );
        let mut mgr = Manager::without_files();
        mgr.merge_toml_file(&path);
        mgr.merge_provider(Overrides {
            upload_duration: Some(3),
            ..Default::default()
        });
        let adapter = mgr.to_display_adapter::<Configuration>(true);
        let (rows, complaints) = adapter.rows().unwrap();

        let row = |name: &str| rows.iter().find(|r| r.field == name).unwrap();
        assert_eq!(row("listen").value, "[::]:3001");
        assert!(row("listen").source.contains("test.toml"));
        assert_eq!(row("upload_duration").value, "3");
        assert_eq!(row("upload_duration").source, "command-line");
        assert_eq!(row("max_connections").source, "default");
        assert!(rows.iter().all(|r| r.field != "unused__"));
        assert_eq!(complaints.len(), 1);
        assert!(complaints[0].contains("unused__"));

        println!("{adapter}");
    }

    #[test]
    fn syntax_error() {
        let (path, _tempdir) = make_test_tempfile(
            r"
            max_connections 123 # missing =
        ",
            "test.toml",
        );
        let mut mgr = Manager::without_files();
        mgr.merge_toml_file(path);
        let err = mgr.get::<Configuration>().unwrap_err();
        println!("{err}");
    }

    #[test]
    fn type_error() {
        let (path, _tempdir) = make_test_tempfile(
            r"
            max_connections = true
        ",
            "test.toml",
        );
        let mut mgr = Manager::without_files();
        mgr.merge_toml_file(path);
        let err = mgr.get::<Configuration>().unwrap_err();
        assert!(err.to_string().contains("max_connections"), "{err}");
    }

    #[test]
    fn chunk_size_parse_failure() {
        let (path, _tempdir) = make_test_tempfile(
            r#"
            initial_chunk_size = "lots"
        "#,
            "test.toml",
        );
        let mut mgr = Manager::without_files();
        mgr.merge_toml_file(path);
        let err = mgr.get::<Configuration>().unwrap_err();
        assert!(err.to_string().contains("parsing bytes string"), "{err}");
    }
}
