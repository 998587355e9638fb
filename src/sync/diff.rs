//! Character-level diffing and patch application.
//!
//! A patch is an ordered list of [`Fragment`]s interpreted against a cursor
//! into the base text: keep a run of characters, drop a run, or insert new
//! text. Applying the fragments left-to-right must consume the base exactly
//! and yields the target text.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// One unit of a text patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Keep `length` characters of the base.
    Same { length: usize },
    /// Insert `contents` at the cursor.
    Added { contents: String },
    /// Drop `length` characters of the base.
    Removed { length: usize },
}

const KIND_SAME: u8 = 0;
const KIND_ADDED: u8 = 1;
const KIND_REMOVED: u8 = 2;

#[derive(Serialize, Deserialize)]
struct RawFragment {
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contents: Option<String>,
}

impl Serialize for Fragment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = match self {
            Fragment::Same { length } => RawFragment {
                kind: KIND_SAME,
                length: Some(*length),
                contents: None,
            },
            Fragment::Added { contents } => RawFragment {
                kind: KIND_ADDED,
                length: None,
                contents: Some(contents.clone()),
            },
            Fragment::Removed { length } => RawFragment {
                kind: KIND_REMOVED,
                length: Some(*length),
                contents: None,
            },
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fragment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawFragment::deserialize(deserializer)?;
        match raw.kind {
            KIND_SAME => Ok(Fragment::Same {
                length: raw.length.ok_or_else(|| D::Error::missing_field("length"))?,
            }),
            KIND_ADDED => Ok(Fragment::Added {
                contents: raw
                    .contents
                    .ok_or_else(|| D::Error::missing_field("contents"))?,
            }),
            KIND_REMOVED => Ok(Fragment::Removed {
                length: raw.length.ok_or_else(|| D::Error::missing_field("length"))?,
            }),
            other => Err(D::Error::custom(format!("unknown fragment kind {other}"))),
        }
    }
}

/// Why a patch could not be applied to a base text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch runs past the end of the base text")]
    PastEnd,

    #[error("patch does not cover the entire base text")]
    Incomplete,
}

/// Compute a minimal character-level patch turning `old` into `new`.
///
/// Classic O(ND) diff over the two character sequences. Deterministic for
/// fixed inputs, and `diff(x, x)` is always empty.
pub fn diff(old: &str, new: &str) -> Vec<Fragment> {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    if a == b {
        return Vec::new();
    }

    let n = a.len();
    let m = b.len();
    let max = (n + m) as isize;
    let idx = |k: isize| (k + max) as usize;

    // Forward pass: remember each depth's furthest-reaching endpoints so the
    // edit path can be walked back afterwards.
    let mut v = vec![0usize; 2 * (n + m) + 1];
    let mut trace: Vec<Vec<usize>> = Vec::new();
    let mut depth = 0;
    'forward: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let mut x = if k == -d || (k != d && v[idx(k - 1)] < v[idx(k + 1)]) {
                v[idx(k + 1)]
            } else {
                v[idx(k - 1)] + 1
            };
            let mut y = (x as isize - k) as usize;
            while x < n && y < m && a[x] == b[y] {
                x += 1;
                y += 1;
            }
            v[idx(k)] = x;
            if x >= n && y >= m {
                depth = d;
                break 'forward;
            }
            k += 2;
        }
    }

    #[derive(Clone, Copy)]
    enum Step {
        Same,
        Add(char),
        Del,
    }

    // Walk back from (n, m), emitting one step per move plus the snakes.
    let mut steps = Vec::new();
    let mut x = n;
    let mut y = m;
    for d in (1..=depth).rev() {
        let prev = &trace[d as usize];
        let k = x as isize - y as isize;
        let prev_k = if k == -d || (k != d && prev[idx(k - 1)] < prev[idx(k + 1)]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = prev[idx(prev_k)];
        let prev_y = (prev_x as isize - prev_k) as usize;
        while x > prev_x && y > prev_y {
            steps.push(Step::Same);
            x -= 1;
            y -= 1;
        }
        if prev_k == k + 1 {
            steps.push(Step::Add(b[y - 1]));
            y -= 1;
        } else {
            steps.push(Step::Del);
            x -= 1;
        }
    }
    while x > 0 && y > 0 {
        steps.push(Step::Same);
        x -= 1;
        y -= 1;
    }

    steps.reverse();
    let mut fragments: Vec<Fragment> = Vec::new();
    for step in steps {
        match (step, fragments.last_mut()) {
            (Step::Same, Some(Fragment::Same { length })) => *length += 1,
            (Step::Same, _) => fragments.push(Fragment::Same { length: 1 }),
            (Step::Del, Some(Fragment::Removed { length })) => *length += 1,
            (Step::Del, _) => fragments.push(Fragment::Removed { length: 1 }),
            (Step::Add(c), Some(Fragment::Added { contents })) => contents.push(c),
            (Step::Add(c), _) => fragments.push(Fragment::Added {
                contents: c.to_string(),
            }),
        }
    }
    fragments
}

/// Apply a patch to `base`, reconstructing the target text.
pub fn apply(base: &str, fragments: &[Fragment]) -> Result<String, PatchError> {
    let chars: Vec<char> = base.chars().collect();
    let mut cursor = 0usize;
    let mut out = String::with_capacity(base.len());

    for fragment in fragments {
        match fragment {
            Fragment::Same { length } => {
                let end = cursor
                    .checked_add(*length)
                    .filter(|&end| end <= chars.len())
                    .ok_or(PatchError::PastEnd)?;
                out.extend(&chars[cursor..end]);
                cursor = end;
            }
            Fragment::Removed { length } => {
                cursor = cursor
                    .checked_add(*length)
                    .filter(|&end| end <= chars.len())
                    .ok_or(PatchError::PastEnd)?;
            }
            Fragment::Added { contents } => out.push_str(contents),
        }
    }

    if cursor != chars.len() {
        return Err(PatchError::Incomplete);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_diff_to_nothing() {
        for text in ["", "a", "startup.lua", "local x = 1\nprint(x)\n", "😀é"] {
            assert_eq!(diff(text, text), Vec::new(), "diff({text:?}, ..)");
        }
    }

    #[test]
    fn pure_insert_and_delete() {
        assert_eq!(
            diff("", "abc"),
            vec![Fragment::Added {
                contents: "abc".to_owned()
            }]
        );
        assert_eq!(diff("abc", ""), vec![Fragment::Removed { length: 3 }]);
        assert_eq!(
            diff("abc", "abcd"),
            vec![
                Fragment::Same { length: 3 },
                Fragment::Added {
                    contents: "d".to_owned()
                }
            ]
        );
        assert_eq!(
            diff("abcd", "abc"),
            vec![Fragment::Same { length: 3 }, Fragment::Removed { length: 1 }]
        );
        assert_eq!(
            diff("bc", "abc"),
            vec![
                Fragment::Added {
                    contents: "a".to_owned()
                },
                Fragment::Same { length: 2 }
            ]
        );
    }

    #[test]
    fn patches_reconstruct_the_target() {
        let cases = [
            ("", ""),
            ("", "hello"),
            ("hello", ""),
            ("kitten", "sitting"),
            ("abcdef", "abXdef"),
            ("the quick brown fox", "the slow brown cat"),
            ("local x = 1\nprint(x)\n", "local x = 2\nprint(x * x)\n"),
            ("héllo wörld", "hello world"),
            ("aaaa", "aabaa"),
        ];
        for (old, new) in cases {
            let patch = diff(old, new);
            assert_eq!(
                apply(old, &patch).as_deref(),
                Ok(new),
                "patch {patch:?} for {old:?} -> {new:?}"
            );
        }
    }

    #[test]
    fn diff_is_deterministic() {
        let (old, new) = ("kitten", "sitting");
        assert_eq!(diff(old, new), diff(old, new));
    }

    #[test]
    fn diff_never_emits_empty_fragments() {
        for (old, new) in [("kitten", "sitting"), ("", "x"), ("x", ""), ("ab", "ba")] {
            for fragment in diff(old, new) {
                match fragment {
                    Fragment::Same { length } | Fragment::Removed { length } => {
                        assert!(length > 0)
                    }
                    Fragment::Added { contents } => assert!(!contents.is_empty()),
                }
            }
        }
    }

    #[test]
    fn apply_rejects_overruns() {
        assert_eq!(
            apply("ab", &[Fragment::Same { length: 3 }]),
            Err(PatchError::PastEnd)
        );
        assert_eq!(
            apply("ab", &[Fragment::Removed { length: 5 }]),
            Err(PatchError::PastEnd)
        );
    }

    #[test]
    fn apply_rejects_short_patches() {
        assert_eq!(
            apply("abc", &[Fragment::Same { length: 2 }]),
            Err(PatchError::Incomplete)
        );
        assert_eq!(apply("abc", &[]), Err(PatchError::Incomplete));
    }

    #[test]
    fn fragment_wire_form() {
        let patch = vec![
            Fragment::Same { length: 2 },
            Fragment::Added {
                contents: "xy".to_owned(),
            },
            Fragment::Removed { length: 1 },
        ];
        let text = serde_json::to_string(&patch).unwrap();
        assert_eq!(
            text,
            r#"[{"kind":0,"length":2},{"kind":1,"contents":"xy"},{"kind":2,"length":1}]"#
        );
        let back: Vec<Fragment> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn fragment_decode_rejects_unknown_kinds() {
        assert!(serde_json::from_str::<Fragment>(r#"{"kind":7,"length":1}"#).is_err());
        assert!(serde_json::from_str::<Fragment>(r#"{"kind":0}"#).is_err());
    }
}
