// ABOUTME: Encodes an argument vector into the single flat command-line
// ABOUTME: string the server's child process will see, in "standard" quoting

/// Joins `args` into one command-line string using the quoting convention
/// `CommandLineToArgvW` expects: each argument is wrapped in `"`, embedded
/// `"` are escaped as `\"`, and a run of backslashes is only doubled when
/// it immediately precedes a quote (either one being escaped, or the
/// argument's closing quote).
pub fn quote_argv(args: &[String]) -> String {
    let mut out = String::new();

    for arg in args {
        if !out.is_empty() {
            out.push(' ');
        }
        quote_one(arg, &mut out);
    }

    out
}

fn quote_one(arg: &str, out: &mut String) {
    out.push('"');

    let chars: Vec<char> = arg.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '"' {
            out.push('\\');
            out.push('"');
            i += 1;
        } else if chars[i] == '\\' {
            let start = i;
            while i < chars.len() && chars[i] == '\\' {
                i += 1;
            }
            let backslash_count = i - start;

            if i < chars.len() && chars[i] == '"' {
                // Backslashes followed by a quote: escape every backslash
                // plus the quote itself.
                out.push_str(&"\\".repeat(backslash_count * 2));
                out.push('\\');
                out.push('"');
                i += 1;
            } else if i == chars.len() {
                // Trailing backslashes: escape them so they don't merge
                // with the closing quote we're about to append.
                out.push_str(&"\\".repeat(backslash_count * 2));
            } else {
                // Backslashes followed by a non-quote: pass through as-is.
                out.push_str(&"\\".repeat(backslash_count));
            }
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }

    out.push('"');
}
