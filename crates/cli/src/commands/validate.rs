//! `validate` command - check a configuration file without running.

use anyhow::Result;
use config_loader::ConfigLoader;
use serde_json::json;

use crate::cli::{ConfigKind, ValidateArgs};

pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    let result = match args.kind {
        ConfigKind::Station => ConfigLoader::load_station(&args.config).map(|_| ()),
        ConfigKind::Proxy => ConfigLoader::load_proxy(&args.config).map(|_| ()),
        ConfigKind::Server => ConfigLoader::load_server(&args.config).map(|_| ()),
    };

    match result {
        Ok(()) => {
            if args.json {
                println!(
                    "{}",
                    json!({"valid": true, "file": args.config.display().to_string()})
                );
            } else {
                println!("{}: OK", args.config.display());
            }
            Ok(())
        }
        Err(e) => {
            if args.json {
                println!(
                    "{}",
                    json!({
                        "valid": false,
                        "file": args.config.display().to_string(),
                        "error": e.to_string(),
                    })
                );
            } else {
                println!("{}: INVALID\n  {}", args.config.display(), e);
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_station_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[daemon]
server_addr = "127.0.0.1:8317"
hmac_secret = "secret"

[plugin]
type = "simulator"
"#
        )
        .unwrap();

        let args = ValidateArgs {
            config: file.path().to_path_buf(),
            kind: ConfigKind::Station,
            json: false,
        };
        assert!(run_validate(&args).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "not a station config").unwrap();

        let args = ValidateArgs {
            config: file.path().to_path_buf(),
            kind: ConfigKind::Station,
            json: false,
        };
        assert!(run_validate(&args).is_err());
    }
}
