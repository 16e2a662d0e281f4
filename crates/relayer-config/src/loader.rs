//! Loading of relayer configuration split across several files.
//!
//! A file may pull in others with `include`, given as one path or a list of
//! paths relative to the including file. Included files may include further
//! files. Top-level sections are merged by name and may appear in only one
//! file, so `[chains]` can live in its own file next to the signer or
//! delivery tuning.

use crate::{resolve_env_vars, Config, ConfigError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use toml::Table;

const INCLUDE_KEY: &str = "include";

/// Loads a relayer configuration and the files it includes.
pub struct ConfigLoader {
	base_path: PathBuf,
	/// Canonical paths already read, used to reject include cycles.
	visited: HashSet<PathBuf>,
	/// File each top-level section came from.
	owners: HashMap<String, PathBuf>,
}

impl ConfigLoader {
	/// Creates a loader resolving relative paths against `base_path`.
	pub fn new(base_path: impl AsRef<Path>) -> Self {
		Self {
			base_path: base_path.as_ref().to_path_buf(),
			visited: HashSet::new(),
			owners: HashMap::new(),
		}
	}

	/// Loads `config_path` with every file it includes and validates the result.
	pub async fn load_config(
		&mut self,
		config_path: impl AsRef<Path>,
	) -> Result<Config, ConfigError> {
		let root = locate(&self.base_path, config_path.as_ref())?;
		let mut merged = Table::new();
		let mut queue = VecDeque::from([root]);

		while let Some(path) = queue.pop_front() {
			let mut table = self.read_table(&path).await?;
			let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
			for include in includes_of(&mut table)? {
				queue.push_back(locate(&dir, &include)?);
			}
			self.merge(&mut merged, table, &path)?;
		}

		let config: Config = toml::Value::Table(merged).try_into()?;
		config.validate()?;
		Ok(config)
	}

	async fn read_table(&mut self, path: &Path) -> Result<Table, ConfigError> {
		let canonical = tokio::fs::canonicalize(path).await?;
		if !self.visited.insert(canonical.clone()) {
			return Err(ConfigError::Validation(format!(
				"Circular include detected: {} was already loaded",
				canonical.display()
			)));
		}

		let content = tokio::fs::read_to_string(path).await?;
		let resolved = resolve_env_vars(&content)?;
		toml::from_str(&resolved).map_err(|e| {
			ConfigError::Parse(format!("{}: {}", path.display(), e.message()))
		})
	}

	fn merge(&mut self, merged: &mut Table, table: Table, source: &Path) -> Result<(), ConfigError> {
		for (section, value) in table {
			if let Some(owner) = self.owners.get(&section) {
				return Err(ConfigError::Validation(format!(
					"Duplicate section '{}' found in {} and {}",
					section,
					owner.display(),
					source.display()
				)));
			}
			self.owners.insert(section.clone(), source.to_path_buf());
			merged.insert(section, value);
		}
		Ok(())
	}
}

/// Removes and returns the include list of `table`.
fn includes_of(table: &mut Table) -> Result<Vec<PathBuf>, ConfigError> {
	match table.remove(INCLUDE_KEY) {
		None => Ok(Vec::new()),
		Some(toml::Value::String(path)) => Ok(vec![PathBuf::from(path)]),
		Some(toml::Value::Array(paths)) => paths
			.into_iter()
			.map(|path| match path {
				toml::Value::String(path) => Ok(PathBuf::from(path)),
				_ => Err(ConfigError::Validation(
					"Include array must contain only strings".into(),
				)),
			})
			.collect(),
		Some(_) => Err(ConfigError::Validation(
			"Include must be a string or array of strings".into(),
		)),
	}
}

fn locate(dir: &Path, path: &Path) -> Result<PathBuf, ConfigError> {
	let resolved = if path.is_absolute() {
		path.to_path_buf()
	} else {
		dir.join(path)
	};
	if !resolved.is_file() {
		return Err(ConfigError::Io(std::io::Error::new(
			std::io::ErrorKind::NotFound,
			format!("Configuration file not found: {}", resolved.display()),
		)));
	}
	Ok(resolved)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::TempDir;

	const CHAINS: &str = r#"
[chains.1]
name = "mainnet"
rpc_urls = ["http://localhost:8545", "http://localhost:8546", "http://localhost:8547"]

[chains.137]
rpc_urls = ["http://localhost:9545"]
avg_block_time_ms = 2000
"#;

	const SIGNER: &str = r#"
[signer]
primary = "local"
[signer.implementations.local]
private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
"#;

	#[tokio::test]
	async fn test_single_file_config() {
		let temp_dir = TempDir::new().unwrap();
		let config_path = temp_dir.path().join("relayer.toml");
		fs::write(&config_path, format!("{}{}", CHAINS, SIGNER)).unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let config = loader.load_config(&config_path).await.unwrap();

		assert_eq!(config.chains.len(), 2);
		assert_eq!(config.chain(137).unwrap().avg_block_time_ms, 2000);
		assert_eq!(config.signer.unwrap().primary, "local");
	}

	#[tokio::test]
	async fn test_config_with_includes() {
		let temp_dir = TempDir::new().unwrap();
		let main_config = r#"
include = ["chains.toml", "signer.toml"]

[delivery]
max_attempts = 4
"#;
		fs::write(temp_dir.path().join("main.toml"), main_config).unwrap();
		fs::write(temp_dir.path().join("chains.toml"), CHAINS).unwrap();
		fs::write(temp_dir.path().join("signer.toml"), SIGNER).unwrap();

		let config = Config::from_file(temp_dir.path().join("main.toml").to_str().unwrap())
			.await
			.unwrap();

		assert_eq!(config.delivery.max_attempts, 4);
		assert_eq!(config.chain(1).unwrap().rpc_urls.len(), 3);
		assert!(config.signer.is_some());
	}

	#[tokio::test]
	async fn test_single_include_string() {
		let temp_dir = TempDir::new().unwrap();
		fs::write(
			temp_dir.path().join("main.toml"),
			"include = \"chains.toml\"\n[nonce]\nfast_mode = true\n",
		)
		.unwrap();
		fs::write(temp_dir.path().join("chains.toml"), CHAINS).unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let config = loader.load_config("main.toml").await.unwrap();
		assert!(config.nonce.fast_mode);
	}

	#[tokio::test]
	async fn test_duplicate_section_error() {
		let temp_dir = TempDir::new().unwrap();
		let main_config = format!("include = [\"duplicate.toml\"]\n{}", CHAINS);
		fs::write(temp_dir.path().join("main.toml"), main_config).unwrap();
		fs::write(temp_dir.path().join("duplicate.toml"), CHAINS).unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let error_msg = loader.load_config("main.toml").await.unwrap_err().to_string();
		assert!(error_msg.contains("Duplicate section 'chains'"));
	}

	#[tokio::test]
	async fn test_self_include_detection() {
		let temp_dir = TempDir::new().unwrap();
		let config = format!("include = [\"self.toml\"]\n{}", CHAINS);
		fs::write(temp_dir.path().join("self.toml"), config).unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let error_msg = loader.load_config("self.toml").await.unwrap_err().to_string();
		assert!(error_msg.contains("already loaded"));
	}

	#[tokio::test]
	async fn test_missing_include() {
		let temp_dir = TempDir::new().unwrap();
		fs::write(temp_dir.path().join("main.toml"), "include = [\"nowhere.toml\"]\n").unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let error = loader.load_config("main.toml").await.unwrap_err();
		assert!(matches!(error, ConfigError::Io(_)));
	}

	#[tokio::test]
	async fn test_nested_include_relative_to_parent() {
		let temp_dir = TempDir::new().unwrap();
		fs::create_dir(temp_dir.path().join("conf")).unwrap();
		fs::write(
			temp_dir.path().join("main.toml"),
			"include = [\"conf/delivery.toml\"]\n",
		)
		.unwrap();
		fs::write(
			temp_dir.path().join("conf/delivery.toml"),
			"include = \"chains.toml\"\n[delivery]\nmax_attempts = 2\n",
		)
		.unwrap();
		fs::write(temp_dir.path().join("conf/chains.toml"), CHAINS).unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let config = loader.load_config("main.toml").await.unwrap();
		assert_eq!(config.delivery.max_attempts, 2);
		assert_eq!(config.chains.len(), 2);
	}

	#[tokio::test]
	async fn test_include_must_be_strings() {
		let temp_dir = TempDir::new().unwrap();
		fs::write(temp_dir.path().join("main.toml"), "include = [1]\n").unwrap();

		let mut loader = ConfigLoader::new(temp_dir.path());
		let error_msg = loader.load_config("main.toml").await.unwrap_err().to_string();
		assert!(error_msg.contains("only strings"));
	}
}
