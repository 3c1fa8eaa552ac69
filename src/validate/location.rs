//! Text forms of location answers.

/// Prefix of a pick-from-list postback: `location:<label>:<id>`.
const POSTBACK_PREFIX: &str = "location";

/// A parsed `location:<label>:<id>` postback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Postback {
    /// Well-formed, with the directory id.
    Place(i64),
    /// Has the prefix but no usable id.
    Malformed,
}

/// Recognise a pick-from-list postback. `None` for ordinary text.
///
/// The label may itself contain `:`; the id is the last segment.
pub fn parse_postback(text: &str) -> Option<Postback> {
    let (prefix, rest) = text.trim().split_once(':')?;
    if prefix != POSTBACK_PREFIX {
        return None;
    }
    let id = rest
        .rsplit_once(':')
        .and_then(|(_, id)| id.trim().parse::<i64>().ok());
    Some(match id {
        Some(id) => Postback::Place(id),
        None => Postback::Malformed,
    })
}

/// Case-insensitive membership in the free-text vocabulary.
pub fn is_known_place(text: &str, vocabulary: &[String]) -> bool {
    let needle = text.trim().to_lowercase();
    !needle.is_empty() && vocabulary.iter().any(|p| p.to_lowercase() == needle)
}
