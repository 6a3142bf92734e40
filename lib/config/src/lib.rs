//! Minimal layered TOML config loader shared by both binaries. Config
//! files are read in order and merged table-by-table, with later
//! paths winning on conflicting keys; env vars and CLI flags layer on
//! top of the result in each binary's own startup code.

use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;

pub struct ConfigLoader<'a> {
  /// Config file paths, applied in order — later files win on
  /// conflicting keys.
  pub paths: &'a [&'a Path],
  /// Log the merged TOML before deserializing.
  pub debug_print: bool,
}

impl ConfigLoader<'_> {
  pub fn load<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
    let mut merged = toml::Value::Table(Default::default());
    for path in self.paths {
      let contents = std::fs::read_to_string(path).with_context(
        || format!("failed to read config file at {path:?}"),
      )?;
      let parsed: toml::Value = toml::from_str(&contents)
        .with_context(|| {
          format!("failed to parse config file at {path:?} as TOML")
        })?;
      merge(&mut merged, parsed);
    }
    if self.debug_print {
      println!("{merged:#?}");
    }
    merged.try_into().context("failed to deserialize merged config")
  }
}

/// Recursively merges `incoming` into `base`: tables merge key by
/// key, anything else (including arrays) is replaced outright.
fn merge(base: &mut toml::Value, incoming: toml::Value) {
  match (base, incoming) {
    (toml::Value::Table(base), toml::Value::Table(incoming)) => {
      for (key, value) in incoming {
        merge(base.entry(key).or_insert(toml::Value::Boolean(false)), value);
      }
    }
    (base, incoming) => *base = incoming,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn later_path_overrides_earlier_keys() {
    let dir = tempdir();
    let base = dir.join("base.toml");
    let override_ = dir.join("override.toml");
    std::fs::write(&base, "port = 8080\nname = \"base\"\n").unwrap();
    std::fs::write(&override_, "port = 9090\n").unwrap();

    #[derive(serde::Deserialize)]
    struct Cfg {
      port: u16,
      name: String,
    }

    let loader = ConfigLoader {
      paths: &[&base, &override_],
      debug_print: false,
    };
    let cfg: Cfg = loader.load().unwrap();
    assert_eq!(cfg.port, 9090);
    assert_eq!(cfg.name, "base");
  }

  fn tempdir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
      "warp-config-test-{}",
      std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }
}
