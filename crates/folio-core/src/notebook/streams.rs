//! Stream output normalization.

use rustc_hash::FxHashMap;

use super::Output;

/// Merge all stream outputs sharing a name into a single stream.
///
/// The merged stream takes the position of the first stream with that name.
/// Backspace and carriage-return control characters are resolved, and a
/// stderr stream directly followed by a stdout stream is swapped so the order
/// is deterministic.
pub fn coalesce_streams(outputs: Vec<Output>) -> Vec<Output> {
    let mut merged: Vec<Output> = Vec::with_capacity(outputs.len());
    let mut stream_positions: FxHashMap<String, usize> = FxHashMap::default();

    for output in outputs {
        match output {
            Output::Stream { name, text } => match stream_positions.get(&name).copied() {
                Some(pos) => {
                    if let Output::Stream { text: existing, .. } = &mut merged[pos] {
                        existing.push_str(&text);
                    }
                }
                None => {
                    stream_positions.insert(name.clone(), merged.len());
                    merged.push(Output::Stream { name, text });
                }
            },
            other => merged.push(other),
        }
    }

    for &pos in stream_positions.values() {
        if let Output::Stream { text, .. } = &mut merged[pos] {
            *text = resolve_carriage_returns(&resolve_backspaces(text));
        }
    }

    for i in 0..merged.len().saturating_sub(1) {
        if is_stream(&merged[i], "stderr") && is_stream(&merged[i + 1], "stdout") {
            merged.swap(i, i + 1);
        }
    }

    merged
}

fn is_stream(output: &Output, stream_name: &str) -> bool {
    matches!(output, Output::Stream { name, .. } if name == stream_name)
}

/// Cancel out any non-newline character followed by a backspace.
fn resolve_backspaces(text: &str) -> String {
    if !text.contains('\u{8}') {
        return text.to_string();
    }
    let mut out: Vec<char> = Vec::with_capacity(text.len());
    for ch in text.chars() {
        if ch == '\u{8}' && out.last().is_some_and(|&prev| prev != '\n' && prev != '\u{8}') {
            out.pop();
        } else {
            out.push(ch);
        }
    }
    out.into_iter().collect()
}

/// Drop line content overwritten by a carriage return.
fn resolve_carriage_returns(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.split_inclusive('\n')
        .map(|line| {
            let body = line.strip_suffix('\n').unwrap_or(line);
            let cut = body
                .char_indices()
                .filter(|&(i, ch)| ch == '\r' && i + 1 < body.len())
                .map(|(i, _)| i + 1)
                .last();
            match cut {
                Some(start) => &line[start..],
                None => line,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str, text: &str) -> Output {
        Output::Stream {
            name: name.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_merges_same_name_streams() {
        let outputs = vec![
            stream("stdout", "a\n"),
            Output::text_result(Some(1), "x"),
            stream("stdout", "b\n"),
        ];
        let merged = coalesce_streams(outputs);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], stream("stdout", "a\nb\n"));
    }

    #[test]
    fn test_stdout_before_stderr() {
        let merged = coalesce_streams(vec![stream("stderr", "warn\n"), stream("stdout", "out\n")]);
        assert_eq!(merged[0], stream("stdout", "out\n"));
        assert_eq!(merged[1], stream("stderr", "warn\n"));
    }

    #[test]
    fn test_carriage_return_progress() {
        let merged = coalesce_streams(vec![stream("stdout", "10%\r50%\r100%\ndone\r\n")]);
        assert_eq!(merged[0], stream("stdout", "100%\ndone\r\n"));
    }

    #[test]
    fn test_backspace() {
        assert_eq!(resolve_backspaces("abc\u{8}\u{8}d"), "ad");
        assert_eq!(resolve_backspaces("a\n\u{8}b"), "a\n\u{8}b");
    }

    #[test]
    fn test_empty() {
        assert!(coalesce_streams(Vec::new()).is_empty());
    }
}
