//! Pattern scanning over a module image.

use memchr::memchr_iter;
use tracing::debug;

use crate::image::ModuleImage;
use crate::pattern::Pattern;

/// A pattern hit, by absolute address and offset from the image base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Match {
    pub address: usize,
    pub offset: usize,
}

/// Every address in the image where `pattern` matches, ascending.
pub fn scan(image: &ModuleImage<'_>, pattern: &Pattern) -> Vec<Match> {
    let mut matches = Vec::new();
    for (address, bytes) in image.spans() {
        for offset in find_in_slice(bytes, pattern) {
            let found = address + offset;
            matches.push(Match {
                address: found,
                offset: found - image.base(),
            });
        }
    }
    debug!(
        "Pattern {} matched {} time(s) in image at {:#x}",
        pattern,
        matches.len(),
        image.base()
    );
    matches
}

/// Lowest matching address, if any.
pub fn scan_first(image: &ModuleImage<'_>, pattern: &Pattern) -> Option<Match> {
    image.spans().find_map(|(address, bytes)| {
        find_in_slice(bytes, pattern).next().map(|offset| Match {
            address: address + offset,
            offset: address + offset - image.base(),
        })
    })
}

/// Scan several patterns, one result slot per pattern in input order.
pub fn scan_many(image: &ModuleImage<'_>, patterns: &[Pattern]) -> Vec<Vec<Match>> {
    patterns.iter().map(|pattern| scan(image, pattern)).collect()
}

/// Whether every slot of a [`scan_many`] result has at least one match.
pub fn all_found(results: &[Vec<Match>]) -> bool {
    results.iter().all(|slot| !slot.is_empty())
}

/// Offsets within `data` where `pattern` matches.
///
/// Candidates come from the first fixed byte of the pattern; a pattern made of
/// wildcards only matches at every offset that leaves room for it.
fn find_in_slice<'a>(data: &'a [u8], pattern: &'a Pattern) -> Box<dyn Iterator<Item = usize> + 'a> {
    if pattern.is_empty() || pattern.len() > data.len() {
        return Box::new(std::iter::empty());
    }
    let last_start = data.len() - pattern.len();

    match pattern.anchor() {
        Some((anchor_index, anchor_byte)) => {
            let window = &data[anchor_index..=last_start + anchor_index];
            Box::new(
                memchr_iter(anchor_byte, window)
                    .filter(move |&start| pattern.matches(&data[start..])),
            )
        }
        None => Box::new(0..=last_start),
    }
}
