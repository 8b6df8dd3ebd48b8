//! Line diffs for cell source edits, in unified format without file headers.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Edit script from a longest-common-subsequence table.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<(Op, &'a str)> {
    let (n, m) = (old.len(), new.len());
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push((Op::Equal, old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push((Op::Delete, old[i]));
            i += 1;
        } else {
            ops.push((Op::Insert, new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().map(|line| (Op::Delete, *line)));
    ops.extend(new[j..].iter().map(|line| (Op::Insert, *line)));
    ops
}

fn range(start: usize, len: usize) -> String {
    match len {
        1 => format!("{}", start + 1),
        0 => format!("{start},0"),
        _ => format!("{},{len}", start + 1),
    }
}

/// Unified diff of two sources with `context` lines around each change.
/// Empty when the sources have the same lines.
pub fn unified_diff(old: &str, new: &str, context: usize) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = edit_script(&old_lines, &new_lines);

    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, (op, _))| *op != Op::Equal)
        .map(|(pos, _)| pos)
        .collect();
    if changes.is_empty() {
        return String::new();
    }
    let keep: Vec<bool> = (0..ops.len())
        .map(|pos| changes.iter().any(|&c| c.abs_diff(pos) <= context))
        .collect();

    // line numbers before each op
    let mut positions = Vec::with_capacity(ops.len());
    let (mut a, mut b) = (0, 0);
    for (op, _) in &ops {
        positions.push((a, b));
        match op {
            Op::Equal => {
                a += 1;
                b += 1;
            }
            Op::Delete => a += 1,
            Op::Insert => b += 1,
        }
    }

    let mut out = Vec::new();
    let mut pos = 0;
    while pos < ops.len() {
        if !keep[pos] {
            pos += 1;
            continue;
        }
        let start = pos;
        while pos < ops.len() && keep[pos] {
            pos += 1;
        }
        let hunk = &ops[start..pos];
        let old_len = hunk.iter().filter(|(op, _)| *op != Op::Insert).count();
        let new_len = hunk.iter().filter(|(op, _)| *op != Op::Delete).count();
        let (old_start, new_start) = positions[start];
        out.push(format!(
            "@@ -{} +{} @@",
            range(old_start, old_len),
            range(new_start, new_len)
        ));
        for (op, line) in hunk {
            let sign = match op {
                Op::Equal => ' ',
                Op::Delete => '-',
                Op::Insert => '+',
            };
            out.push(format!("{sign}{line}"));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_sources_have_no_diff() {
        assert_eq!(unified_diff("a\nb", "a\nb\n", 3), "");
    }

    #[test]
    fn test_single_line_change() {
        assert_eq!(
            unified_diff("x = 1\nprint(x)", "x = 2\nprint(x)", 3),
            "@@ -1,2 +1,2 @@\n-x = 1\n+x = 2\n print(x)"
        );
    }

    #[test]
    fn test_context_is_bounded() {
        let old: Vec<String> = (1..=10).map(|i| format!("line{i}")).collect();
        let mut new = old.clone();
        new[4] = "changed".into();
        let diff = unified_diff(&old.join("\n"), &new.join("\n"), 3);
        let lines: Vec<&str> = diff.lines().collect();
        assert_eq!(lines[0], "@@ -2,7 +2,7 @@");
        assert_eq!(lines[1], " line2");
        assert_eq!(lines.last(), Some(&" line8"));
    }

    #[test]
    fn test_distant_changes_split_into_hunks() {
        let old: Vec<String> = (1..=20).map(|i| format!("l{i}")).collect();
        let mut new = old.clone();
        new[0] = "first".into();
        new[19] = "last".into();
        let diff = unified_diff(&old.join("\n"), &new.join("\n"), 3);
        assert_eq!(diff.matches("@@ -").count(), 2);
    }

    #[test]
    fn test_from_empty() {
        assert_eq!(unified_diff("", "a", 3), "@@ -0,0 +1 @@\n+a");
    }
}
