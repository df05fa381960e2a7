use akio::audio::queue::{ended_target, previous_target, skip_target, LoopMode, Track, EXHAUSTED};
use akio::storage::{GuildProp, QueueStore};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const GUILD: u64 = 1_000_000_000_000_001;

fn track(n: usize) -> Track {
    Track {
        title: format!("Track {n}"),
        uri: format!("https://example.com/{n}"),
        duration: 180_000,
        identifier: format!("id-{n}"),
        author: "Someone".to_string(),
        requester: 7,
    }
}

#[test]
fn queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue_data.json");

    {
        let store = QueueStore::new(&path, 70).unwrap();
        store.extend_tracks(GUILD, (0..3).map(track).collect());
        store.set_index(GUILD, 1);
        store.set_guild_prop(GUILD, GuildProp::Loop(LoopMode::Queue));
        store.set_guild_prop(GUILD, GuildProp::Volume(150));
    }

    let reopened = QueueStore::new(&path, 70).unwrap();
    let state = reopened.get_guild(GUILD);
    assert_eq!(state.queue.len(), 3);
    assert_eq!(state.index, 1);
    assert_eq!(state.loop_mode, LoopMode::Queue);
    assert_eq!(state.volume, 150);
    assert_eq!(reopened.current_track(GUILD), Some(track(1)));
    assert_eq!(reopened.guild_ids(), vec![GUILD]);
}

#[test]
fn stored_document_is_keyed_by_guild_with_numeric_loop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue_data.json");
    let store = QueueStore::new(&path, 70).unwrap();
    store.append_track(GUILD, track(0));
    store.set_guild_prop(GUILD, GuildProp::Loop(LoopMode::Track));

    let raw = std::fs::read_to_string(&path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let entry = &doc[GUILD.to_string()];
    assert_eq!(entry["loop"], 1);
    assert_eq!(entry["index"], 0);
    assert_eq!(entry["shuffle"], false);
    assert_eq!(entry["queue"][0]["title"], "Track 0");
}

#[test]
fn corrupt_file_reads_as_empty_and_is_rewritten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue_data.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = QueueStore::new(&path, 70).unwrap();
    assert!(store.get_queue(GUILD).is_empty());
    assert_eq!(store.get_index(GUILD), 0);

    store.append_track(GUILD, track(0));
    let reopened = QueueStore::new(&path, 70).unwrap();
    assert_eq!(reopened.get_queue(GUILD), vec![track(0)]);
}

#[test]
fn continuation_rules_follow_the_persisted_state() {
    let dir = TempDir::new().unwrap();
    let store = QueueStore::new(dir.path().join("q.json"), 70).unwrap();
    store.extend_tracks(GUILD, (0..3).map(track).collect());
    store.set_index(GUILD, 2);

    let state = store.get_guild(GUILD);
    assert_eq!(ended_target(&state), None);
    assert_eq!(skip_target(&state), None);
    assert_eq!(previous_target(&state), Some(1));

    store.set_guild_prop(GUILD, GuildProp::Loop(LoopMode::Queue));
    let state = store.get_guild(GUILD);
    assert_eq!(ended_target(&state), Some(0));
    assert_eq!(skip_target(&state), Some(0));

    store.set_guild_prop(GUILD, GuildProp::Loop(LoopMode::Track));
    let state = store.get_guild(GUILD);
    assert_eq!(ended_target(&state), Some(2));
    assert_eq!(skip_target(&state), None);
}

#[test]
fn exhausted_queue_resumes_from_new_tracks() {
    let dir = TempDir::new().unwrap();
    let store = QueueStore::new(dir.path().join("q.json"), 70).unwrap();
    store.extend_tracks(GUILD, (0..2).map(track).collect());
    store.set_index(GUILD, EXHAUSTED);

    let state = store.get_guild(GUILD);
    assert!(state.is_exhausted());
    assert_eq!(state.current(), None);
    assert_eq!(ended_target(&state), None);

    let first_new = store.append_track(GUILD, track(2));
    assert_eq!(first_new, 2);
    // quitar algo con la cola agotada no mueve el índice
    assert_eq!(store.remove_at(GUILD, 0), Some(track(0)));
    assert_eq!(store.get_index(GUILD), EXHAUSTED);
}

#[test]
fn clearing_one_guild_leaves_the_others() {
    let dir = TempDir::new().unwrap();
    let store = QueueStore::new(dir.path().join("q.json"), 70).unwrap();
    let other = GUILD + 1;
    store.append_track(GUILD, track(0));
    store.append_track(other, track(1));
    store.set_guild_prop(GUILD, GuildProp::Volume(300));

    store.clear_guild(GUILD);

    let cleared = store.get_guild(GUILD);
    assert!(cleared.queue.is_empty());
    assert_eq!(cleared.volume, 70);
    assert_eq!(store.get_queue(other), vec![track(1)]);

    let stats = store.stats();
    assert_eq!(stats.guilds, 2);
    assert_eq!(stats.tracks, 1);
}
