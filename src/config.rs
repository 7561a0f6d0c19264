//! The INI-like configuration file: a `[machine]` section plus one section
//! per device, keyed by `internal_name`, holding typed option values. No
//! crate in the dependency stack is dedicated to this exact format, so it is
//! hand-rolled rather than pulling in a parser crate for a one-off grammar.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

/// One `key = value` section, e.g. `[machine]` or `[ide0]`.
#[derive(Debug, Clone, Default)]
pub struct Section {
    values: HashMap<String, String>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str, line: usize) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some("true") | Some("1") | Some("yes") => Ok(Some(true)),
            Some("false") | Some("0") | Some("no") => Ok(Some(false)),
            Some(other) => Err(ConfigError::InvalidValue {
                line,
                option: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn get_u32(&self, key: &str, line: usize) -> Result<Option<u32>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<u32>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    line,
                    option: key.to_string(),
                    value: value.to_string(),
                }),
        }
    }
}

/// A parsed configuration file: the `[machine]` section plus every
/// per-device section, in file order.
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    pub machine: Section,
    sections: Vec<(String, Section)>,
}

impl MachineConfig {
    pub fn device(&self, internal_name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|(name, _)| name == internal_name)
            .map(|(_, section)| section)
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(name, _)| name.as_str())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut machine = Section::default();
        let mut sections: Vec<(String, Section)> = Vec::new();
        let mut current: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let name = name.trim();
                if name.eq_ignore_ascii_case("machine") {
                    current = None;
                } else {
                    sections.push((name.to_string(), Section::default()));
                    current = Some(name.to_string());
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line: line_no,
                    text: line.to_string(),
                });
            };
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            match &current {
                None => {
                    machine.values.insert(key, value);
                }
                Some(name) => {
                    let section = sections
                        .iter_mut()
                        .find(|(n, _)| n == name)
                        .map(|(_, s)| s)
                        .expect("current section was just pushed");
                    section.values.insert(key, value);
                }
            }
        }

        Ok(Self { machine, sections })
    }

    /// Serialize back to the INI-like text format. Round-trips `parse`
    /// losslessly for values and section order, though not for comments or
    /// blank-line formatting.
    pub fn to_string_pretty(&self) -> String {
        let mut out = String::new();
        if !self.machine.values.is_empty() {
            out.push_str("[machine]\n");
            write_section(&mut out, &self.machine);
            out.push('\n');
        }
        for (name, section) in &self.sections {
            out.push_str(&format!("[{name}]\n"));
            write_section(&mut out, section);
            out.push('\n');
        }
        out
    }
}

fn write_section(out: &mut String, section: &Section) {
    let mut keys: Vec<&String> = section.values.keys().collect();
    keys.sort();
    for key in keys {
        out.push_str(&format!("{key} = {}\n", section.values[key]));
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(';').or_else(|| line.find('#')) {
        Some(idx) => &line[..idx],
        None => line,
    }
}
