//! Splits operator input into tokens.

/// Splits `input` on whitespace, keeping double-quoted segments together.
///
/// Inside quotes, `\"` produces a literal quote. A quote left open at the end
/// of the line keeps whatever followed it verbatim. `""` yields an empty token.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '\\' if chars.peek() == Some(&'"') => {
                    chars.next();
                    current.push('"');
                }
                '"' => quoted = false,
                _ => current.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                quoted = true;
                in_token = true;
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            _ => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    tokens
}
