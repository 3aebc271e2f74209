//! Parsed playlist + persisted registry, the way the daemon combines them.

use plusradio_proto::playlist::{Playlist, GENERIC_CATEGORY};
use plusradio_proto::registry::StationRegistry;
use plusradio_proto::store::FileStore;

const RADYO_M3U: &str = r#"#EXTM3U
#EXTINF:-1,----- RADYO KANALLARI -----
#EXTINF:-1 tvg-logo="http://logo.example/pop.png" group-title="Pop",Power Pop
http://power/pop
#EXTINF:-1,Alem FM | Pop
http://alem/stream
#EXTINF:-1,Spor Radyo
http://spor/stream
#EXTINF:-1,Bilinmeyen Kanal
http://unknown/stream
#EXTINF:-1 group-title="Nostalji",Power Pop
http://power/pop
http://orphan/stream
"#;

#[test]
fn test_duplicate_entries_share_registry_state() {
    let playlist = Playlist::parse(RADYO_M3U);
    let stations = playlist.stations();
    assert_eq!(stations.len(), 5);
    assert!(stations.iter().all(|s| s.url != "http://orphan/stream"));

    let names: Vec<&str> = stations.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["Power Pop", "Alem FM", "Spor Radyo", "Bilinmeyen Kanal", "Power Pop"]
    );
    assert_eq!(stations[1].group, "Pop");
    assert_eq!(stations[2].group, "Spor");
    assert_eq!(stations[3].group, GENERIC_CATEGORY);
    assert_eq!(
        playlist.categories(),
        &["Pop", "Spor", "Genel", "Nostalji"].map(String::from)
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("registry.json");

    {
        let mut registry = StationRegistry::new(Box::new(FileStore::open(&path)));
        // the Nostalji copy is the same station as the Pop one
        assert!(registry.toggle_favorite(&stations[4]));
        assert!(registry.is_favorite(&stations[0]));
        assert!(registry.mark_broken(&stations[0]));
        assert!(!registry.mark_broken(&stations[4]));
        registry.add_to_recently_played(&stations[1]);
    }

    let registry = StationRegistry::new(Box::new(FileStore::open(&path)));
    assert!(registry.is_broken(&stations[4]));
    assert!(registry.is_favorite(&stations[4]));
    assert!(registry.is_recent(&stations[1]));

    let listed: Vec<&str> = playlist
        .get_stations_by_category("Pop")
        .into_iter()
        .filter(|s| !registry.is_broken(s))
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(listed, vec!["Alem FM"]);

    let id = stations[0].id();
    assert_eq!(playlist.find(&id).map(|s| s.group.as_str()), Some("Pop"));
}
