//! Key schema for the session tree inside the file store.
//!
//! ```text
//! sessions/<sid>/events/000000.json    one event per file, zero-padded id
//! sessions/<sid>/cursors/<name>.json   {"last_id": N}
//! sessions/<sid>/state.json            latest serialized controller state
//! sessions/<sid>/metadata.json         inputs, timestamps, repository/branch
//! ```

pub const EVENT_ID_WIDTH: usize = 6;

pub fn session_prefix(session_id: &str) -> String {
    format!("sessions/{session_id}")
}

pub fn events_prefix(session_id: &str) -> String {
    format!("sessions/{session_id}/events/")
}

pub fn event_key(session_id: &str, id: u64) -> String {
    format!("sessions/{session_id}/events/{id:0width$}.json", width = EVENT_ID_WIDTH)
}

pub fn cursor_key(session_id: &str, subscriber: &str) -> String {
    format!("sessions/{session_id}/cursors/{subscriber}.json")
}

pub fn state_key(session_id: &str) -> String {
    format!("sessions/{session_id}/state.json")
}

pub fn metadata_key(session_id: &str) -> String {
    format!("sessions/{session_id}/metadata.json")
}

/// Parse the event id back out of a store key produced by [`event_key`].
pub fn event_id_from_key(key: &str) -> Option<u64> {
    let name = key.rsplit('/').next()?;
    let digits = name.strip_suffix(".json")?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_keys_are_zero_padded_and_parse_back() {
        let key = event_key("ses_1", 42);
        assert_eq!(key, "sessions/ses_1/events/000042.json");
        assert_eq!(event_id_from_key(&key), Some(42));
    }

    #[test]
    fn nested_delegate_sessions_stay_under_the_parent() {
        let key = event_key("ses_1/d0", 0);
        assert_eq!(key, "sessions/ses_1/d0/events/000000.json");
        assert_eq!(event_id_from_key(&key), Some(0));
    }
}
