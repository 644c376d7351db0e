//! Album cache and the visibility filter applied to every album listing.

use std::collections::HashSet;

use albumfs_core::is_valid_segment;

use crate::model::{AlbumSummary, Asset};

/// Albums whose description contains this marker are invisible to the
/// gateway.
pub const NOSYNC_MARKER: &str = "#nosync";

/// Applies the visibility rules, in order: drop albums whose description
/// contains `opt_out_marker`, drop names that cannot stand as a path
/// segment, drop case-insensitive duplicate names keeping the first
/// occurrence. Pure function of the input list; input order is preserved.
pub fn filter_albums(albums: Vec<AlbumSummary>, opt_out_marker: &str) -> Vec<AlbumSummary> {
    let mut seen: HashSet<String> = HashSet::new();
    albums
        .into_iter()
        .filter(|album| !album.description.contains(opt_out_marker))
        .filter(|album| is_valid_segment(&album.album_name))
        .filter(|album| seen.insert(album.album_name.to_lowercase()))
        .collect()
}

/// One album row in the cache, with its lazily fetched assets.
#[derive(Debug, Clone)]
pub(crate) struct CachedAlbum {
    pub summary: AlbumSummary,
    /// `None` until the album detail has been fetched once.
    pub assets: Option<Vec<Asset>>,
}

/// In-memory view of the visible catalog for one connection.
///
/// An empty album list means "not fetched yet"; resolution helpers refetch
/// in that case, so a catalog with zero visible albums is simply refetched
/// on every lookup.
#[derive(Debug, Default)]
pub(crate) struct CatalogCache {
    pub albums: Vec<CachedAlbum>,
}

impl CatalogCache {
    /// Replaces the album list, dropping all previously fetched assets.
    pub fn replace_albums(&mut self, filtered: Vec<AlbumSummary>) {
        self.albums = filtered
            .into_iter()
            .map(|summary| CachedAlbum {
                summary,
                assets: None,
            })
            .collect();
    }

    /// Exact-name lookup among the visible albums.
    pub fn by_name(&self, name: &str) -> Option<&CachedAlbum> {
        self.albums.iter().find(|a| a.summary.album_name == name)
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut CachedAlbum> {
        self.albums
            .iter_mut()
            .find(|a| a.summary.album_name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album(id: &str, name: &str, description: &str) -> AlbumSummary {
        AlbumSummary {
            id: id.to_string(),
            album_name: name.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn filter_drops_marked_invalid_and_duplicate_names() {
        let input = vec![
            album("1", "A", ""),
            album("2", "a", ""),
            album("3", "B", "#nosync"),
            album("4", "bad/name", ""),
        ];
        let visible: Vec<_> = filter_albums(input, "#nosync")
            .into_iter()
            .map(|a| a.album_name)
            .collect();
        assert_eq!(visible, vec!["A".to_string()]);
    }

    #[test]
    fn filter_keeps_first_of_case_insensitive_duplicates() {
        let input = vec![
            album("1", "Trip", ""),
            album("2", "TRIP", ""),
            album("3", "trip", ""),
            album("4", "Other", ""),
        ];
        let visible = filter_albums(input, "#nosync");
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].id, "1");
        assert_eq!(visible[1].album_name, "Other");
    }

    #[test]
    fn filter_marker_matches_anywhere_in_description() {
        let input = vec![
            album("1", "Kept", "family pictures"),
            album("2", "Hidden", "do not mirror #nosync please"),
        ];
        let visible = filter_albums(input, "#nosync");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].album_name, "Kept");
    }

    #[test]
    fn filter_preserves_input_order() {
        let input = vec![
            album("1", "Zoo", ""),
            album("2", "Alps", ""),
            album("3", "Mid", ""),
        ];
        let names: Vec<_> = filter_albums(input, "#nosync")
            .into_iter()
            .map(|a| a.album_name)
            .collect();
        assert_eq!(names, vec!["Zoo", "Alps", "Mid"]);
    }

    #[test]
    fn cache_lookup_is_case_sensitive() {
        let mut cache = CatalogCache::default();
        cache.replace_albums(vec![album("1", "Trip", "")]);
        assert!(cache.by_name("Trip").is_some());
        assert!(cache.by_name("trip").is_none());
    }

    #[test]
    fn replace_albums_drops_fetched_assets() {
        let mut cache = CatalogCache::default();
        cache.replace_albums(vec![album("1", "Trip", "")]);
        cache.by_name_mut("Trip").unwrap().assets = Some(Vec::new());
        cache.replace_albums(vec![album("1", "Trip", "")]);
        assert!(cache.by_name("Trip").unwrap().assets.is_none());
    }
}
