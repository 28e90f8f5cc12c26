//! Command line parsing for the agent binary.

/// What the binary should do after parsing its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliAction {
    Run { log_level: Option<String> },
    Help(String),
    Version(String),
    Error(String),
}

pub fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} [--log-level LEVEL] [--help|-h] [--version|-V]\n\
         Configuration is read from HOSTWATCH_* environment variables."
    )
}

pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> CliAction {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "hostwatch_agent".into());
    let mut log_level: Option<String> = None;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return CliAction::Help(usage(&prog)),
            "-V" | "--version" => {
                return CliAction::Version(format!("{prog} {}", env!("CARGO_PKG_VERSION")))
            }
            "--log-level" => match it.next() {
                Some(v) if !v.is_empty() => log_level = Some(v),
                _ => {
                    return CliAction::Error(format!(
                        "--log-level needs a value. {}",
                        usage(&prog)
                    ))
                }
            },
            _ if arg.starts_with("--log-level=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        log_level = Some(v.to_string());
                    }
                }
            }
            _ => {
                return CliAction::Error(format!("Unexpected argument {arg:?}. {}", usage(&prog)))
            }
        }
    }
    CliAction::Run { log_level }
}
