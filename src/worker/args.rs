//! Command line for the inference child.

use std::ffi::OsString;

use crate::config::WorkerConfig;

/// Arguments passed to the executable, in order:
/// `-m <model> -c <ctx> --temp <t> [-ngl <n>] [-fa] [extra...]`.
pub fn build_args(config: &WorkerConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-m".into(),
        config.model_path.clone().into_os_string(),
        "-c".into(),
        config.context_size.to_string().into(),
        "--temp".into(),
        config.temperature.to_string().into(),
    ];

    if config.gpu_layers > 0 {
        args.push("-ngl".into());
        args.push(config.gpu_layers.to_string().into());
    }

    if config.flash_attention {
        args.push("-fa".into());
    }

    args.extend(config.extra_args.iter().map(OsString::from));
    args
}

/// Human-readable rendering for logs.
pub fn display_command(config: &WorkerConfig) -> String {
    let mut line = format!("\"{}\"", config.executable.display());
    for arg in build_args(config) {
        let arg = arg.to_string_lossy();
        if arg.contains(' ') {
            line.push_str(&format!(" \"{arg}\""));
        } else {
            line.push(' ');
            line.push_str(&arg);
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(config: &WorkerConfig) -> Vec<String> {
        build_args(config)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_all_tunables_propagate() {
        let mut config = WorkerConfig::new("llama-cli", "models/m.gguf");
        config.context_size = 2048;
        config.gpu_layers = 33;
        config.temperature = 0.5;
        config.flash_attention = true;

        assert_eq!(
            strings(&config),
            vec![
                "-m",
                "models/m.gguf",
                "-c",
                "2048",
                "--temp",
                "0.5",
                "-ngl",
                "33",
                "-fa"
            ]
        );
    }

    #[test]
    fn test_cpu_only_without_flash_attention() {
        let mut config = WorkerConfig::new("llama-cli", "m.gguf");
        config.gpu_layers = 0;
        config.flash_attention = false;
        config.extra_args = vec!["--simple-io".to_string()];

        let args = strings(&config);
        assert!(!args.contains(&"-ngl".to_string()));
        assert!(!args.contains(&"-fa".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--simple-io"));
    }

    #[test]
    fn test_display_command_quotes_spaces() {
        let config = WorkerConfig::new("/opt/llama/llama-cli", "/my models/m.gguf");
        let line = display_command(&config);
        assert!(line.starts_with("\"/opt/llama/llama-cli\" -m \"/my models/m.gguf\""));
    }
}
