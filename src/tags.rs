//! Tag normalization and the reserved namespace check.
//!
//! Tags are indexed strings attached to users and topics. A configured set of
//! namespace prefixes (`basic:`, `email:`, ...) is reserved for
//! credential-derived tags; clients may not assign or drop those directly.

/// Shortest tag accepted.
const MIN_TAG_LENGTH: usize = 2;
/// Longest tag accepted.
const MAX_TAG_LENGTH: usize = 96;
/// Most tags a single object may carry.
const MAX_TAG_COUNT: usize = 16;

/// Trim, length-filter, case-fold and deduplicate client-supplied tags.
/// Returns `None` when nothing survives.
pub fn normalize_tags<I, S>(tags: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim().to_lowercase();
        if tag.len() < MIN_TAG_LENGTH || tag.len() > MAX_TAG_LENGTH {
            continue;
        }
        if !out.contains(&tag) {
            out.push(tag);
        }
        if out.len() == MAX_TAG_COUNT {
            break;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Namespace prefix of a tag, if it has one.
fn tag_namespace(tag: &str) -> Option<&str> {
    tag.split_once(':').map(|(ns, _)| ns)
}

/// Check that the restricted subset of tags is unchanged between `old` and
/// `new`. With an empty `old` this verifies that no restricted tags are being
/// assigned at all.
pub fn restricted_tags_equal(old: &[String], new: &[String], restricted: &[String]) -> bool {
    let filter = |tags: &[String]| -> Vec<String> {
        let mut subset: Vec<String> = tags
            .iter()
            .filter(|t| {
                tag_namespace(t).map(|ns| restricted.iter().any(|r| r == ns)).unwrap_or(false)
            })
            .cloned()
            .collect();
        subset.sort();
        subset
    };
    filter(old) == filter(new)
}

/// Elements of `required` missing from `present`.
pub fn missing_methods(required: &[String], present: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|m| !present.contains(m))
        .cloned()
        .collect()
}
