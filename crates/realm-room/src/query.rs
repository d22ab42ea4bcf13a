//! Filtered, sorted, paginated room listings.

use std::cmp::Ordering;

use realm_protocol::{RoomFilter, RoomPage, RoomQuery, SortKey};

use crate::{Room, RoomRegistry};

/// Returns `true` if `room` passes every condition in `filter`.
pub fn matches_filter(room: &Room, filter: &RoomFilter) -> bool {
    if room.is_private() && !filter.include_private {
        return false;
    }
    if room.is_full() && !filter.include_full {
        return false;
    }
    if let Some(needle) = &filter.name_contains {
        if !room.name().to_lowercase().contains(&needle.to_lowercase()) {
            return false;
        }
    }
    if let Some(segment) = &filter.segment {
        if room.segment() != Some(segment.as_str()) {
            return false;
        }
    }
    filter
        .custom
        .iter()
        .all(|(key, value)| room.custom_data().get(key) == Some(value))
}

fn compare(a: &Room, b: &Room, key: SortKey) -> Ordering {
    let primary = match key {
        SortKey::Created => Ordering::Equal,
        SortKey::Name => a.name().cmp(b.name()),
        SortKey::PlayerCount => a.player_count().cmp(&b.player_count()),
    };
    primary.then_with(|| a.created_seq().cmp(&b.created_seq()))
}

/// Runs `query` against the registry.
///
/// The requested page size is clamped to `1..=max_page_size`; the page
/// actually used is reported back. A page past the end is empty but still
/// carries the total.
pub fn run_query(registry: &RoomRegistry, query: &RoomQuery, max_page_size: usize) -> RoomPage {
    let page_size = (query.page_size as usize).clamp(1, max_page_size.max(1));

    let mut rooms: Vec<&Room> = registry
        .list_rooms(|room| matches_filter(room, &query.filter))
        .collect();
    rooms.sort_by(|a, b| {
        let order = compare(a, b, query.sort);
        if query.descending { order.reverse() } else { order }
    });

    let total = rooms.len();
    let start = (query.page as usize).saturating_mul(page_size);
    let summaries = rooms
        .into_iter()
        .skip(start)
        .take(page_size)
        .map(|room| room.info().to_summary())
        .collect();

    RoomPage {
        rooms: summaries,
        page: query.page,
        page_size: page_size as u32,
        total,
    }
}

#[cfg(test)]
mod tests {
    use realm_protocol::RoomState;
    use realm_scene::WorldBinding;
    use realm_transport::ConnectionId;

    use super::*;
    use crate::RoomSpec;

    fn populated() -> RoomRegistry {
        let mut registry = RoomRegistry::new(Some(3));
        let specs = [
            RoomSpec::new("Alpha Arena", "Map1", 2).with_data("mode", "ctf"),
            RoomSpec::new("bravo", "Map2", 4).with_data("mode", "dm"),
            RoomSpec::new("Charlie arena", "Map1", 8).with_data("mode", "ctf"),
            RoomSpec::new("Secret", "Map1", 4).private_with_token("pw"),
        ];
        for spec in &specs {
            let id = registry.create_room(spec).unwrap().id();
            registry.transition(id, RoomState::Loading);
            registry.set_world(id, Some(WorldBinding::Headless));
            registry.transition(id, RoomState::Active);
        }
        let alpha = registry.get_room(&"Alpha Arena".into()).unwrap().id();
        registry.bind(ConnectionId::new(1), alpha).unwrap();
        registry.bind(ConnectionId::new(2), alpha).unwrap();
        let charlie = registry.get_room(&"Charlie arena".into()).unwrap().id();
        registry.bind(ConnectionId::new(3), charlie).unwrap();
        registry
    }

    fn names(page: &RoomPage) -> Vec<&str> {
        page.rooms.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_default_query_hides_full_and_private() {
        let page = run_query(&populated(), &RoomQuery::default(), 100);
        assert_eq!(names(&page), ["bravo", "Charlie arena"]);
        assert_eq!(page.total, 2);
    }

    #[test]
    fn test_name_filter_is_case_insensitive() {
        let mut query = RoomQuery::default();
        query.filter.name_contains = Some("ARENA".into());
        query.filter.include_full = true;
        let page = run_query(&populated(), &query, 100);
        assert_eq!(names(&page), ["Alpha Arena", "Charlie arena"]);
    }

    #[test]
    fn test_segment_and_custom_filters() {
        let mut query = RoomQuery::default();
        query.filter.segment = Some("Map1".into());
        query.filter.custom.insert("mode".into(), "ctf".into());
        query.filter.include_full = true;
        query.filter.include_private = true;
        let page = run_query(&populated(), &query, 100);
        assert_eq!(names(&page), ["Alpha Arena", "Charlie arena"]);
    }

    #[test]
    fn test_sort_by_player_count_descending() {
        let query = RoomQuery {
            filter: RoomFilter {
                include_full: true,
                include_private: true,
                ..Default::default()
            },
            sort: SortKey::PlayerCount,
            descending: true,
            ..Default::default()
        };
        let page = run_query(&populated(), &query, 100);
        assert_eq!(page.rooms[0].name, "Alpha Arena");
        assert_eq!(page.rooms[1].name, "Charlie arena");
    }

    #[test]
    fn test_pagination_clamps_page_size() {
        let query = RoomQuery {
            filter: RoomFilter {
                include_full: true,
                include_private: true,
                ..Default::default()
            },
            page: 1,
            page_size: 50,
            sort: SortKey::Name,
            ..Default::default()
        };
        let page = run_query(&populated(), &query, 3);
        assert_eq!(page.page_size, 3);
        assert_eq!(page.total, 4);
        // Byte order puts uppercase names first: Alpha, Charlie, Secret, bravo.
        assert_eq!(names(&page), ["bravo"]);
    }

    #[test]
    fn test_page_past_end_is_empty() {
        let query = RoomQuery {
            page: 9,
            ..Default::default()
        };
        let page = run_query(&populated(), &query, 100);
        assert!(page.rooms.is_empty());
        assert_eq!(page.total, 2);
    }
}
