//! Local `%`-prefixed console commands spoken by a client (spec.md §4.G
//! "Console commands"), grounded on the original `Command.cxx` dispatch.

/// A parsed console command. Anything not matching a known form becomes
/// `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Reconnect,
    CharList,
    CharSwitch(u32),
    Drop,
    Verbose(u8),
    Unknown(String),
}

/// Parses a speech line. `None` means the line isn't a console command at
/// all (doesn't start with `%`) and should be forwarded as ordinary
/// speech.
pub fn parse(line: &str) -> Option<Command> {
    let rest = line.strip_prefix('%')?;
    let rest = rest.trim();

    if rest.is_empty() {
        return Some(Command::Help);
    }

    let mut parts = rest.split_whitespace();
    let head = parts.next().unwrap_or("");
    let arg = parts.next();

    Some(match head {
        "reconnect" => Command::Reconnect,
        "char" => match arg.and_then(|a| a.parse().ok()) {
            Some(slot) => Command::CharSwitch(slot),
            None => Command::CharList,
        },
        "drop" => Command::Drop,
        "verbose" => match arg.and_then(|a| a.parse().ok()) {
            Some(level) => Command::Verbose(level),
            None => Command::Unknown(rest.to_string()),
        },
        _ => Command::Unknown(rest.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_percent_is_help() {
        assert_eq!(parse("%"), Some(Command::Help));
    }

    #[test]
    fn non_command_speech_is_none() {
        assert_eq!(parse("hello there"), None);
    }

    #[test]
    fn char_without_arg_lists() {
        assert_eq!(parse("%char"), Some(Command::CharList));
    }

    #[test]
    fn char_with_slot_switches() {
        assert_eq!(parse("%char 2"), Some(Command::CharSwitch(2)));
    }

    #[test]
    fn verbose_parses_level() {
        assert_eq!(parse("%verbose 5"), Some(Command::Verbose(5)));
    }

    #[test]
    fn unknown_command_is_reported() {
        assert_eq!(parse("%bogus"), Some(Command::Unknown("bogus".into())));
    }
}
