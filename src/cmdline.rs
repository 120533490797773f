// ABOUTME: Splits a flat, Windows-quoted command line back into an argv
// ABOUTME: vector — the server-side inverse of client::quote::quote_argv

/// Splits `command_line` into arguments using the same quoting rules the
/// client's [`crate::client::quote::quote_argv`] produces (and that
/// `CommandLineToArgvW` consumes): a `"`-delimited argument may contain
/// escaped quotes (`\"`), and a run of backslashes only escapes a quote
/// that immediately follows it.
///
/// The first argument conventionally echoes the program name; callers that
/// already know the program path (from the `A` frame) typically want
/// `split_command_line(line).get(1..)` as the argument list.
pub fn split_command_line(command_line: &str) -> Vec<String> {
    let chars: Vec<char> = command_line.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i] == ' ' {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let mut current = String::new();
        let mut in_quotes = false;

        while i < chars.len() {
            if !in_quotes && chars[i] == ' ' {
                break;
            }

            if chars[i] == '\\' {
                let mut backslashes = 0;
                while i < chars.len() && chars[i] == '\\' {
                    backslashes += 1;
                    i += 1;
                }

                if i < chars.len() && chars[i] == '"' {
                    current.push_str(&"\\".repeat(backslashes / 2));
                    if backslashes % 2 == 1 {
                        current.push('"');
                        i += 1;
                    } else {
                        in_quotes = !in_quotes;
                        i += 1;
                    }
                } else {
                    current.push_str(&"\\".repeat(backslashes));
                }
            } else if chars[i] == '"' {
                in_quotes = !in_quotes;
                i += 1;
            } else {
                current.push(chars[i]);
                i += 1;
            }
        }

        args.push(current);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::quote::quote_argv;

    #[test]
    fn splits_plain_arguments() {
        assert_eq!(
            split_command_line("cmd.exe /c echo hello"),
            vec!["cmd.exe", "/c", "echo", "hello"]
        );
    }

    #[test]
    fn round_trips_through_quoting() {
        let original = vec![
            "prog".to_string(),
            "an arg with spaces".to_string(),
            "quote\"inside".to_string(),
            r"trailing\backslashes\".to_string(),
        ];
        let quoted = quote_argv(&original);
        assert_eq!(split_command_line(&quoted), original);
    }

    #[test]
    fn empty_line_has_no_arguments() {
        assert!(split_command_line("").is_empty());
        assert!(split_command_line("   ").is_empty());
    }
}
