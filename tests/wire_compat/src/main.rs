fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use paperdrop_protocol::{
        FinalizeRequest, FinalizeResponse, JobState, ProgressSnapshot, SessionRecord,
    };
    use paperdrop_upload::{JobEvent, JobId};

    const JOB_ID: &str = "6a1f3c2e-8d4b-4e7a-9c10-2b5e7f8a9d01";

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON values.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    fn job_id() -> JobId {
        serde_json::from_value(serde_json::json!(JOB_ID)).unwrap()
    }

    // --- Persisted state ---

    #[test]
    fn fixture_session_record() {
        let record: SessionRecord = roundtrip_test("session_record.json");
        assert_eq!(record.acked_indices, vec![0, 1, 2, 3, 5, 8]);
        assert!(record.matches_plan(26_214_400, 1_048_576));
        assert!(record.is_acked(5));
        assert!(!record.is_acked(4));
    }

    #[test]
    fn session_record_without_acks_defaults_empty() {
        let mut fixture = load_fixture("session_record.json");
        fixture.as_object_mut().unwrap().remove("ackedIndices");
        let record: SessionRecord = serde_json::from_value(fixture).unwrap();
        assert!(record.acked_indices.is_empty());
    }

    // --- Service bodies ---

    #[test]
    fn fixture_finalize_request() {
        let request: FinalizeRequest = roundtrip_test("finalize_request.json");
        assert_eq!(request.chunk_count, 9);
        assert_eq!(request.mime_type, "application/pdf");
    }

    #[test]
    fn fixture_finalize_response() {
        let response: FinalizeResponse = roundtrip_test("finalize_response.json");
        assert_eq!(response.file_id, "f_01HV3K8Z6Q");
    }

    #[test]
    fn finalize_response_tolerates_missing_fields() {
        let response: FinalizeResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response, FinalizeResponse::default());
        assert_eq!(serde_json::to_string(&response).unwrap(), "{}");
    }

    // --- Observability ---

    #[test]
    fn fixture_progress_snapshot() {
        let snapshot: ProgressSnapshot = roundtrip_test("progress_snapshot.json");
        assert!((snapshot.percentage() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn progress_snapshot_omits_unknown_eta() {
        let value = serde_json::to_value(ProgressSnapshot::empty(JOB_ID, 10)).unwrap();
        assert!(value.get("etaSecs").is_none());
    }

    #[test]
    fn job_event_chunk_failed_shape() {
        let event = JobEvent::ChunkFailed {
            job_id: job_id(),
            index: 10,
            attempts: 3,
            error: "transient transport error: request timed out".into(),
            will_retry: true,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            load_fixture("job_event_chunk_failed.json")
        );
    }

    #[test]
    fn job_event_state_changed_shape() {
        let event = JobEvent::StateChanged {
            job_id: job_id(),
            from: JobState::Uploading,
            to: JobState::Retrying,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            load_fixture("job_event_state_changed.json")
        );
    }

    #[test]
    fn job_state_names_roundtrip() {
        for state in [
            JobState::Queued,
            JobState::Validating,
            JobState::Uploading,
            JobState::Paused,
            JobState::Retrying,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
            let back: JobState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, state);
        }
    }
}
