//! Era index: cyclic generation counter and range selection over era numbers.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;

/// Era number. Content is grouped and addressed by the era in which it was written.
pub type Era = u32;

/// First era of a fresh storage; the counter wraps back to it after `MAX_ERA`.
pub const INITIAL_ERA: Era = 0;

/// Last era before the counter wraps.
pub const MAX_ERA: Era = Era::MAX;

/// Era following `era`, wrapping to `INITIAL_ERA` after `MAX_ERA`.
pub fn next_era(era: Era) -> Era {
    if era == MAX_ERA {
        INITIAL_ERA
    } else {
        era + 1
    }
}

/// Era preceding `era`, wrapping to `MAX_ERA` before `INITIAL_ERA`.
pub fn previous_era(era: Era) -> Era {
    if era == INITIAL_ERA {
        MAX_ERA
    } else {
        era - 1
    }
}

/// Eras present under `root`: every direct entry whose name parses as an era.
/// Non-numeric entries are skipped. A missing root yields an empty set.
pub fn eras_present(root: impl AsRef<Path>) -> io::Result<BTreeSet<Era>> {
    let entries = match std::fs::read_dir(root.as_ref()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e),
    };
    let mut eras = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if let Some(era) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<Era>().ok())
        {
            eras.insert(era);
        }
    }
    Ok(eras)
}

/// Select the eras of `space` lying in `[from, to]`.
///
/// `from > to` means the interval has passed the wrap point: it covers
/// `from..=MAX_ERA` followed by `INITIAL_ERA..=to`. `from == to` selects exactly
/// that era.
pub fn select_in_range<'a, I>(space: I, from: Era, to: Era) -> BTreeSet<Era>
where
    I: IntoIterator<Item = &'a Era>,
{
    space
        .into_iter()
        .copied()
        .filter(|&era| in_range(era, from, to))
        .collect()
}

/// Whether `era` lies in the (possibly wrapped) interval `[from, to]`.
pub fn in_range(era: Era, from: Era, to: Era) -> bool {
    if from <= to {
        //INIT ---- from-> ++++++++ <-to ---- MAX
        era >= from && era <= to
    } else {
        // INIT ++++ <-to -------- from-> ++++ MAX
        era <= to || era >= from
    }
}
