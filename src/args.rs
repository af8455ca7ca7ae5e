//! Command-line argument parsing.
//!
//! Arguments are parsed with clap and then reduced to a single [`CliAction`]
//! so `main` only has to match on what to do.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "kelvind", version, about)]
pub struct Args {
    /// Configuration file to use instead of the XDG default
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable detailed debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Drive an in-memory display instead of real hardware
    #[arg(long)]
    pub dry_run: bool,

    /// Apply the current temperature once and exit
    #[arg(long, conflicts_with_all = ["times", "reset"])]
    pub once: bool,

    /// Print today's solar times and transition windows, then exit
    #[arg(long, conflicts_with = "reset")]
    pub times: bool,

    /// Restore the original gamma on every monitor and exit
    #[arg(long)]
    pub reset: bool,
}

/// What the binary should do after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum CliAction {
    /// Run the daemon until a shutdown signal arrives
    Run,
    /// Apply the current target immediately and exit
    Once,
    /// Print solar times for today
    ShowTimes,
    /// Restore original gamma
    Reset,
}

/// Parsed arguments and the action they select.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArgs {
    pub action: CliAction,
    pub config_path: Option<PathBuf>,
    pub debug_enabled: bool,
    pub dry_run: bool,
}

impl ParsedArgs {
    /// Parse an argument list, including the program name.
    pub fn parse<I, S>(args: I) -> Result<ParsedArgs, clap::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from(Args::try_parse_from(args)?))
    }

    /// Parse the process arguments, exiting with clap's usage message on error.
    pub fn from_env() -> ParsedArgs {
        Self::from(Args::parse())
    }
}

impl From<Args> for ParsedArgs {
    fn from(args: Args) -> Self {
        let action = if args.reset {
            CliAction::Reset
        } else if args.times {
            CliAction::ShowTimes
        } else if args.once {
            CliAction::Once
        } else {
            CliAction::Run
        };

        ParsedArgs {
            action,
            config_path: args.config,
            debug_enabled: args.debug,
            dry_run: args.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_no_args() {
        let parsed = ParsedArgs::parse(["kelvind"]).unwrap();
        assert_eq!(parsed.action, CliAction::Run);
        assert!(!parsed.debug_enabled);
        assert!(!parsed.dry_run);
        assert_eq!(parsed.config_path, None);
    }

    #[test]
    fn test_parse_flags() {
        let parsed =
            ParsedArgs::parse(["kelvind", "-d", "--dry-run", "--config", "/tmp/k.toml"]).unwrap();
        assert_eq!(parsed.action, CliAction::Run);
        assert!(parsed.debug_enabled);
        assert!(parsed.dry_run);
        assert_eq!(parsed.config_path, Some(PathBuf::from("/tmp/k.toml")));
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(
            ParsedArgs::parse(["kelvind", "--once"]).unwrap().action,
            CliAction::Once
        );
        assert_eq!(
            ParsedArgs::parse(["kelvind", "--times"]).unwrap().action,
            CliAction::ShowTimes
        );
        assert_eq!(
            ParsedArgs::parse(["kelvind", "--reset"]).unwrap().action,
            CliAction::Reset
        );
    }

    #[test]
    fn test_conflicting_actions_are_rejected() {
        assert!(ParsedArgs::parse(["kelvind", "--once", "--reset"]).is_err());
        assert!(ParsedArgs::parse(["kelvind", "--times", "--reset"]).is_err());
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        assert!(ParsedArgs::parse(["kelvind", "--geo"]).is_err());
    }
}
