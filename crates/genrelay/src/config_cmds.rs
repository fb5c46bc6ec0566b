use anyhow::{Result, bail};
use std::path::Path;

use genrelay_config::{Config, validate_config};

pub(crate) fn handle_config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let target = match path {
        Some(p) => p.to_path_buf(),
        None => Config::config_path()?,
    };
    if target.exists() && !force {
        bail!(
            "Config already exists at {} (use --force to overwrite)",
            target.display()
        );
    }
    let written = Config::save_default_template(Some(&target))?;
    eprintln!("Generated config template at: {}", written.display());
    eprintln!("  Set the environment variables it names before starting a worker.");
    Ok(())
}

pub(crate) fn handle_config_show(path: Option<&Path>) -> Result<()> {
    let config = Config::load(path)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

pub(crate) fn handle_config_validate(path: Option<&Path>) -> Result<()> {
    let config = Config::load(path)?;
    validate_config(&config)?;
    eprintln!(
        "Configuration valid: {} policies, {} providers",
        config.policies.len(),
        config.providers.len()
    );
    Ok(())
}
