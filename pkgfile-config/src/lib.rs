//! Parser for pacman style INI configuration files.
//!
//! Only the keys pkgfile cares about are surfaced: the ordered
//! architecture list from `[options]` and the ordered mirror list of every
//! repository section. Everything else (`SigLevel`, `NoExtract`, ...) is
//! accepted and ignored.

use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, format_err, Error};

/// One repository section: a short name plus its ordered mirror list.
///
/// Server entries are URL templates with `$arch` and `$repo` placeholders;
/// earlier servers are preferred.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub servers: Vec<String>,
}

impl Repository {
    /// Candidate URLs for this repo's `.files` archive, in failover order:
    /// servers in configuration order, each tried with every architecture.
    pub fn archive_urls(&self, architectures: &[String]) -> Vec<String> {
        let mut urls = Vec::new();
        for server in &self.servers {
            for arch in architectures {
                let base = server.replace("$arch", arch).replace("$repo", &self.name);
                urls.push(format!("{}/{}.files", base.trim_end_matches('/'), self.name));
            }
        }
        urls
    }
}

/// The parts of a pacman configuration pkgfile consumes.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub architectures: Vec<String>,
    pub repos: Vec<Repository>,
}

impl Config {
    pub fn repo_names(&self) -> Vec<String> {
        self.repos.iter().map(|repo| repo.name.clone()).collect()
    }

    /// Architectures to try, falling back to the host architecture when the
    /// configuration does not set any.
    pub fn architectures(&self) -> Vec<String> {
        if self.architectures.is_empty() {
            vec![std::env::consts::ARCH.to_string()]
        } else {
            self.architectures.clone()
        }
    }
}

/// Parse the configuration file at `path`.
pub fn config_from_file(path: &Path) -> Result<Config, Error> {
    let file = std::fs::File::open(path)
        .map_err(|err| format_err!("unable to open config file {:?} - {}", path, err))?;
    parse_config(std::io::BufReader::new(file))
        .map_err(|err| format_err!("unable to parse config file {:?} - {}", path, err))
}

/// Parse a pacman style configuration from `reader`.
///
/// Fails on malformed lines and on configurations without any repository
/// section - pkgfile has nothing to work with then.
pub fn parse_config<R: BufRead>(reader: R) -> Result<Config, Error> {
    let mut config = Config::default();
    let mut section: Option<String> = None;

    for (line_nr, line) in reader.lines().enumerate() {
        let line_nr = line_nr + 1;
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or_else(|| format_err!("line {}: unterminated section header", line_nr))?
                .trim();
            if name.is_empty() {
                bail!("line {}: empty section name", line_nr);
            }
            if name != "options" && !config.repos.iter().any(|repo| repo.name == name) {
                config.repos.push(Repository {
                    name: name.to_owned(),
                    servers: Vec::new(),
                });
            }
            section = Some(name.to_owned());
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, ""),
        };

        let section = match section {
            Some(ref section) => section.as_str(),
            None => bail!("line {}: option '{}' outside of any section", line_nr, key),
        };

        match (section, key) {
            ("options", "Architecture") => {
                config
                    .architectures
                    .extend(value.split_ascii_whitespace().map(String::from));
            }
            ("options", _) => (), // not our business
            (_, "Server") => {
                if value.is_empty() {
                    bail!("line {}: repo '{}' has an empty Server entry", line_nr, section);
                }
                let repo = config
                    .repos
                    .iter_mut()
                    .find(|repo| repo.name == section)
                    .unwrap();
                repo.servers.push(value.to_owned());
            }
            _ => (), // Include, SigLevel, Usage, ...
        }
    }

    if config.repos.is_empty() {
        bail!("no repositories configured");
    }

    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    const TEST_CONFIG: &str = r#"
        # pacman.conf
        [options]
        Architecture = x86_64 x86_64_v3
        SigLevel = Required

        [testing]
        Server = https://mirror.example.org/$arch/$repo
        Server = https://fallback.example.org/$arch/$repo

        [multilib]
        Server = https://mirror.example.org/$arch/$repo
    "#;

    #[test]
    fn test_parse_config() {
        let config = parse_config(Cursor::new(TEST_CONFIG)).unwrap();

        assert_eq!(config.architectures, ["x86_64", "x86_64_v3"]);
        assert_eq!(config.repo_names(), ["testing", "multilib"]);
        assert_eq!(config.repos[0].servers.len(), 2);
        assert_eq!(config.repos[1].servers.len(), 1);
    }

    #[test]
    fn test_archive_urls() {
        let config = parse_config(Cursor::new(TEST_CONFIG)).unwrap();

        let urls = config.repos[0].archive_urls(&config.architectures());
        assert_eq!(
            urls,
            [
                "https://mirror.example.org/x86_64/testing/testing.files",
                "https://mirror.example.org/x86_64_v3/testing/testing.files",
                "https://fallback.example.org/x86_64/testing/testing.files",
                "https://fallback.example.org/x86_64_v3/testing/testing.files",
            ],
        );
    }

    #[test]
    fn test_reject_empty_config() {
        assert!(parse_config(Cursor::new("[options]\n")).is_err());
        assert!(parse_config(Cursor::new("")).is_err());
    }

    #[test]
    fn test_reject_option_outside_section() {
        assert!(parse_config(Cursor::new("Server = https://x\n[repo]\n")).is_err());
    }

    #[test]
    fn test_default_architecture_fallback() {
        let config = parse_config(Cursor::new("[core]\nServer = https://x/$repo\n")).unwrap();
        assert!(!config.architectures().is_empty());
    }

    #[test]
    fn test_repeated_sections_merge() {
        let input = "[core]\nServer = https://a/$repo\n[extra]\nServer = https://a/$repo\n[core]\nServer = https://b/$repo\n";
        let config = parse_config(Cursor::new(input)).unwrap();

        assert_eq!(config.repo_names(), ["core", "extra"]);
        assert_eq!(config.repos[0].servers.len(), 2);
    }
}
