use crate::constants::update::MAX_VERSION_LENGTH;
use crate::updater::UpdateFound;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("Empty version")]
    Empty,
    #[error("Empty version part")]
    EmptyPart,
    #[error("Invalid version integer part")]
    InvalidPart,
    #[error("Version length is too long")]
    TooLong,
}

fn parse(version: &str) -> Result<Vec<u16>, VersionError> {
    if version.is_empty() {
        return Err(VersionError::Empty);
    }
    version
        .split('.')
        .map(|part| match part {
            "" => Err(VersionError::EmptyPart),
            part if !part.bytes().all(|b| b.is_ascii_digit()) => Err(VersionError::InvalidPart),
            part => part.parse::<u16>().map_err(|_| VersionError::InvalidPart),
        })
        .collect()
}

/// Compares dotted versions segment by segment; missing trailing segments
/// count as zero. A malformed segment on either side is an error.
pub fn version_newer_than(candidate: &str, ours: &str) -> Result<bool, VersionError> {
    let candidate = parse(candidate)?;
    let ours = parse(ours)?;
    let length = candidate.len().max(ours.len());
    for i in 0..length {
        let c = candidate.get(i).copied().unwrap_or(0);
        let o = ours.get(i).copied().unwrap_or(0);
        match c.cmp(&o) {
            Ordering::Equal => continue,
            ordering => return Ok(ordering == Ordering::Greater),
        }
    }
    Ok(false)
}

/// Picks the newest artifact for `arch` that is newer than `running`.
/// Entries for other architectures or packagings are ignored.
pub fn find_candidate(
    files: &BTreeMap<String, [u8; 32]>,
    prefix: &str,
    arch: &str,
    suffix: &str,
    running: &str,
) -> Result<Option<UpdateFound>, VersionError> {
    let arch_prefix = format!("{}{}-", prefix, arch);
    let mut best: Option<(&str, &String, &[u8; 32])> = None;

    for (name, hash) in files {
        let Some(version) = name
            .strip_prefix(&arch_prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
        else {
            continue;
        };
        if version.len() > MAX_VERSION_LENGTH {
            return Err(VersionError::TooLong);
        }
        if !version_newer_than(version, running)? {
            continue;
        }
        let better = match best {
            Some((best_version, _, _)) => version_newer_than(version, best_version)?,
            None => true,
        };
        if better {
            best = Some((version, name, hash));
        }
    }

    Ok(best.map(|(_, name, hash)| UpdateFound {
        name: name.clone(),
        hash: *hash,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert_eq!(version_newer_than("1.10.0", "1.9.9"), Ok(true));
        assert_eq!(version_newer_than("1.2", "1.2.0"), Ok(false));
        assert_eq!(version_newer_than("1.2.0", "1.2"), Ok(false));
        assert_eq!(version_newer_than("1.2.1", "1.2"), Ok(true));
        assert_eq!(version_newer_than("0.9", "1"), Ok(false));
        assert_eq!(version_newer_than("2", "1.99.99"), Ok(true));
    }

    #[test]
    fn test_malformed_versions_are_errors() {
        assert_eq!(version_newer_than("", "1.0"), Err(VersionError::Empty));
        assert_eq!(version_newer_than("1..2", "1.0"), Err(VersionError::EmptyPart));
        assert_eq!(version_newer_than("1.x", "1.0"), Err(VersionError::InvalidPart));
        assert_eq!(version_newer_than("1.+2", "1.0"), Err(VersionError::InvalidPart));
        assert_eq!(version_newer_than("1.0", "1.0."), Err(VersionError::EmptyPart));
        assert_eq!(version_newer_than("1.70000", "1.0"), Err(VersionError::InvalidPart));
    }

    fn files(names: &[&str]) -> BTreeMap<String, [u8; 32]> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), [i as u8; 32]))
            .collect()
    }

    #[test]
    fn test_find_candidate_picks_newest_for_arch() {
        let files = files(&[
            "tunnel-manager-amd64-0.5.0.msi",
            "tunnel-manager-amd64-0.7.0.msi",
            "tunnel-manager-amd64-0.6.2.msi",
            "tunnel-manager-arm64-9.0.0.msi",
            "tunnel-manager-amd64-9.0.0.zip",
        ]);
        let found = find_candidate(&files, "tunnel-manager-", "amd64", ".msi", "0.6.0")
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "tunnel-manager-amd64-0.7.0.msi");
        assert_eq!(found.hash, files["tunnel-manager-amd64-0.7.0.msi"]);
    }

    #[test]
    fn test_find_candidate_none_is_not_an_error() {
        let files = files(&["tunnel-manager-amd64-0.1.0.msi", "README"]);
        assert_eq!(
            find_candidate(&files, "tunnel-manager-", "amd64", ".msi", "0.1.0"),
            Ok(None)
        );
    }

    #[test]
    fn test_find_candidate_rejects_long_version() {
        let long = format!("tunnel-manager-amd64-{}.msi", "1".repeat(200));
        let files = files(&[long.as_str()]);
        assert_eq!(
            find_candidate(&files, "tunnel-manager-", "amd64", ".msi", "0.1.0"),
            Err(VersionError::TooLong)
        );
    }

    #[test]
    fn test_find_candidate_malformed_is_error() {
        let files = files(&["tunnel-manager-amd64-1.beta.msi"]);
        assert_eq!(
            find_candidate(&files, "tunnel-manager-", "amd64", ".msi", "0.1.0"),
            Err(VersionError::InvalidPart)
        );
    }
}
