//! Wire frames exchanged with clients
//!
//! The transport is a framed bidirectional channel (the service binary
//! carries these as JSON text over a WebSocket). Frames are named by their
//! `event` tag; field names are camelCase on the wire.

use crate::submission::FileEntry;
use serde::{Deserialize, Serialize};

/// Frames sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Submit a bundle of files for execution
    Run {
        /// Echo of the server-assigned session key (ignored; the server
        /// trusts only its own binding)
        #[serde(default)]
        session_key: Option<String>,
        /// Target language, as spelled on the wire
        language: String,
        /// Submitted files
        files: Vec<FileEntry>,
        /// Client-chosen identifier for this run
        #[serde(default)]
        submission_id: Option<String>,
    },
    /// Bytes for the running program's stdin
    Input {
        /// Raw input data
        data: String,
    },
    /// Terminate the running submission
    Stop {
        /// Echo of the server-assigned session key (ignored)
        #[serde(default)]
        session_key: Option<String>,
    },
}

/// Stream tag of an output frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// Program standard output
    Stdout,
    /// Program standard error
    Stderr,
    /// Orchestrator-generated notice (e.g. termination)
    System,
}

/// Frames sent to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Connection greeting carrying the server-assigned session key
    Session {
        /// Opaque key identifying this connection
        session_key: String,
    },
    /// A batch-coalesced chunk of program output
    Output {
        /// Originating session
        session_key: String,
        /// Stream tag
        #[serde(rename = "type")]
        output_type: OutputType,
        /// Chunk contents
        data: String,
    },
    /// End of one submission
    Exit {
        /// Originating session
        session_key: String,
        /// Program exit code; -1 for stopped or abnormal runs
        code: i64,
        /// Wall-clock execution time in milliseconds, when known
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_time: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_frame_wire_shape() {
        let json = r#"{
            "event": "run",
            "sessionKey": "abc",
            "language": "python",
            "files": [{"path": "main.py", "content": "print('hi')", "toBeExec": true}]
        }"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Run {
                session_key,
                language,
                files,
                submission_id,
            } => {
                assert_eq!(session_key.as_deref(), Some("abc"));
                assert_eq!(language, "python");
                assert_eq!(files.len(), 1);
                assert!(files[0].to_be_exec);
                assert!(submission_id.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_output_frame_keeps_type_field() {
        let frame = ServerFrame::Output {
            session_key: "abc".to_string(),
            output_type: OutputType::Stderr,
            data: "boom\n".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "output");
        assert_eq!(json["type"], "stderr");
        assert_eq!(json["sessionKey"], "abc");
    }

    #[test]
    fn test_exit_frame_omits_unknown_execution_time() {
        let frame = ServerFrame::Exit {
            session_key: "abc".to_string(),
            code: -1,
            execution_time: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("executionTime"));

        let timed = ServerFrame::Exit {
            session_key: "abc".to_string(),
            code: 0,
            execution_time: Some(12),
        };
        let json = serde_json::to_string(&timed).unwrap();
        assert!(json.contains("\"executionTime\":12"));
    }

    #[test]
    fn test_stop_frame_roundtrip() {
        let json = r#"{"event":"stop","sessionKey":"abc"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Stop {
                session_key: Some("abc".to_string())
            }
        );
    }
}
