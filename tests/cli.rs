#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::io::Write;
use tempfile::TempDir;

fn garde_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("garde");
    path
}

/// Stand-in for the `claude` CLI. Refuses to run without the recursion
/// guard and answers every prompt with the same extraction envelope.
const FAKE_CLAUDE: &str = r#"#!/bin/sh
cat > /dev/null
if [ "$GARDE_SUBAGENT" != "1" ]; then
  echo "guard variable missing" >&2
  exit 3
fi
cat <<'EOF'
{"type":"result","is_error":false,"result":"{\"summary\":\"Taught the pelican importer to stream rows.\",\"learnings\":[{\"insight\":\"buffering hides backpressure\"}],\"entities\":[{\"mention\":\"rustlang\",\"confidence\":\"high\"},{\"mention\":\"Quokka board\",\"confidence\":\"medium\"}]}"}
EOF
"#;

const GLOSSARY: &str = r#"
[entities.rust]
name = "Rust"
aliases = ["rustlang"]
"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let script = root.join("fake-claude");
    fs::write(&script, FAKE_CLAUDE).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    fs::write(root.join("glossary.toml"), GLOSSARY).unwrap();

    let session = root.join("session.jsonl");
    fs::write(&session, "{}").unwrap();

    let long = "user: the pelican importer keeps stalling on big files.\n\n\
                assistant: it buffers everything; switching it to stream rows fixes that.";
    let records = [
        serde_json::json!({
            "id": "claude_code:abc123",
            "type": "claude_code",
            "title": "Pelican importer",
            "path": session.display().to_string(),
            "updated_at": "2026-04-02T09:00:00Z",
            "full_text": long,
        }),
        serde_json::json!({
            "id": "handoff:h1",
            "type": "handoff",
            "title": "Quick note",
            "full_text": "remember the pelican",
        }),
    ];
    let jsonl: Vec<String> = records.iter().map(|r| r.to_string()).collect();
    fs::write(root.join("sources.jsonl"), jsonl.join("\n")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/garde.sqlite"

[extraction]
command = "{root}/fake-claude"
timeout_secs = 10

[entities]
glossary_path = "{root}/glossary.toml"

[staging]
dir = "{root}/staged"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("garde.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_garde(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    run_garde_with(config_path, args, &[], None)
}

fn run_garde_with(
    config_path: &Path,
    args: &[&str],
    env: &[(&str, &str)],
    stdin: Option<&str>,
) -> (String, String, bool) {
    let binary = garde_binary();
    let mut cmd = Command::new(&binary);
    cmd.arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("GARDE_SUBAGENT")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd
        .spawn()
        .unwrap_or_else(|e| panic!("Failed to run garde binary at {:?}: {}", binary, e));
    {
        let mut pipe = child.stdin.take().unwrap();
        if let Some(input) = stdin {
            pipe.write_all(input.as_bytes()).unwrap();
        }
    }
    let output = child.wait_with_output().unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_end_to_end() {
    let (tmp, config) = setup_test_env();
    let root = tmp.path();

    let (stdout, stderr, ok) = run_garde(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));

    let sources = root.join("sources.jsonl");
    let (stdout, stderr, ok) = run_garde(&config, &["ingest", sources.to_str().unwrap()]);
    assert!(ok, "ingest failed: {}", stderr);
    assert!(stdout.contains("new: 2"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["backfill", "--dry-run"]);
    assert!(ok);
    assert!(stdout.contains("would process: 2"), "{}", stdout);

    let (stdout, stderr, ok) = run_garde(&config, &["backfill", "--limit", "0"]);
    assert!(ok, "backfill failed: {}", stderr);
    assert!(stdout.contains("selected: 0"));

    let (stdout, stderr, ok) = run_garde(&config, &["backfill"]);
    assert!(ok, "backfill failed: {}", stderr);
    assert!(stdout.contains("processed: 1"), "{}\n{}", stdout, stderr);
    assert!(stdout.contains("stubbed: 1"), "{}", stdout);
    assert!(stdout.contains("failed: 0"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["search", "pelican"]);
    assert!(ok);
    assert!(stdout.contains("claude_code:abc123"), "{}", stdout);
    assert!(stdout.contains("handoff:h1"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["search", "pelican", "--source-type", "handoff"]);
    assert!(ok);
    assert!(!stdout.contains("claude_code:abc123"));

    let (stdout, stderr, ok) = run_garde(&config, &["search", "stream-rows"]);
    assert!(ok, "hyphenated search failed: {}", stderr);
    assert!(stdout.contains("claude_code:abc123"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["resolve", "list"]);
    assert!(ok);
    assert!(stdout.contains("Quokka board"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["status"]);
    assert!(ok);
    assert!(stdout.contains("Sources:     2"), "{}", stdout);
    assert!(stdout.contains("skipped:content_too_short"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["verify-index"]);
    assert!(ok);
    assert!(stdout.contains("consistent"));

    let (stdout, _, ok) = run_garde(&config, &["rebuild-index"]);
    assert!(ok);
    assert!(stdout.contains("2 rows"), "{}", stdout);

    fs::remove_file(root.join("session.jsonl")).unwrap();
    let (stdout, _, ok) = run_garde(&config, &["prune"]);
    assert!(ok);
    assert!(stdout.contains("stale: claude_code:abc123"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["search", "pelican"]);
    assert!(ok);
    assert!(stdout.contains("status: stale"), "{}", stdout);
}

#[test]
fn test_store_extraction_from_stdin() {
    let (tmp, config) = setup_test_env();
    let sources = tmp.path().join("sources.jsonl");
    run_garde(&config, &["ingest", sources.to_str().unwrap()]);

    let extraction = r#"Extraction follows.
{"summary": "Closed out the heron migration.", "builds": ["heron schema"]}"#;
    let (stdout, stderr, ok) = run_garde_with(
        &config,
        &["store-extraction", "claude_code:abc123"],
        &[],
        Some(extraction),
    );
    assert!(ok, "store-extraction failed: {}", stderr);
    assert!(stdout.contains("status: processed"), "{}", stdout);
    assert!(tmp.path().join("staged/claude_code/abc123.json.spent").exists());

    let (stdout, _, ok) = run_garde(&config, &["search", "heron"]);
    assert!(ok);
    assert!(stdout.contains("claude_code:abc123"));

    let (_, stderr, ok) = run_garde_with(
        &config,
        &["store-extraction", "claude_code:nope"],
        &[],
        Some(extraction),
    );
    assert!(!ok);
    assert!(stderr.contains("Source not found"));
}

#[test]
fn test_guard_variable_blocks_pipeline_commands() {
    let (tmp, config) = setup_test_env();
    let sources = tmp.path().join("sources.jsonl");
    run_garde(&config, &["ingest", sources.to_str().unwrap()]);

    for args in [
        vec!["backfill"],
        vec!["process", "claude_code:abc123"],
        vec!["store-extraction", "claude_code:abc123"],
    ] {
        let (_, stderr, ok) =
            run_garde_with(&config, &args, &[("GARDE_SUBAGENT", "1")], Some("{}"));
        assert!(!ok, "{:?} should refuse to run", args);
        assert!(stderr.contains("recursion guard"), "{}", stderr);
    }

    // read-only commands still work
    let (_, _, ok) = run_garde_with(&config, &["status"], &[("GARDE_SUBAGENT", "1")], None);
    assert!(ok);
}

#[test]
fn test_failed_invocation_is_reported() {
    let (tmp, config) = setup_test_env();
    let broken = tmp.path().join("fake-claude");
    fs::write(&broken, "#!/bin/sh\ncat > /dev/null\necho 'quota exceeded' >&2\nexit 1\n").unwrap();

    let sources = tmp.path().join("sources.jsonl");
    run_garde(&config, &["ingest", sources.to_str().unwrap()]);

    let (stdout, stderr, ok) = run_garde(&config, &["backfill"]);
    assert!(ok, "a failed source must not fail the batch: {}", stderr);
    assert!(stdout.contains("failed: 1"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["status"]);
    assert!(ok);
    assert!(stdout.contains("quota exceeded"), "{}", stdout);
}

#[test]
fn test_retry_failed_after_invocation_recovers() {
    let (tmp, config) = setup_test_env();
    let script = tmp.path().join("fake-claude");
    fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho 'quota exceeded' >&2\nexit 1\n").unwrap();

    let sources = tmp.path().join("sources.jsonl");
    run_garde(&config, &["ingest", sources.to_str().unwrap()]);
    let (stdout, _, _) = run_garde(&config, &["backfill"]);
    assert!(stdout.contains("failed: 1"), "{}", stdout);

    fs::write(&script, FAKE_CLAUDE).unwrap();
    let (stdout, _, ok) = run_garde(&config, &["backfill"]);
    assert!(ok);
    assert!(stdout.contains("selected: 0"), "{}", stdout);

    let (stdout, _, ok) = run_garde(&config, &["backfill", "--retry-failed", "--dry-run"]);
    assert!(ok);
    assert!(stdout.contains("(retry)"), "{}", stdout);

    let (stdout, stderr, ok) = run_garde(&config, &["backfill", "--retry-failed"]);
    assert!(ok, "retry failed: {}", stderr);
    assert!(stdout.contains("processed: 1"), "{}", stdout);
    assert!(stdout.contains("failed: 0"), "{}", stdout);
}

#[test]
fn test_extract_prompt_and_glossary_check() {
    let (tmp, config) = setup_test_env();
    let sources = tmp.path().join("sources.jsonl");
    run_garde(&config, &["ingest", sources.to_str().unwrap()]);

    let (stdout, stderr, ok) = run_garde(&config, &["extract-prompt", "claude_code:abc123"]);
    assert!(ok, "extract-prompt failed: {}", stderr);
    assert!(stdout.contains("switching it to stream rows"), "{}", stdout);
    assert!(stdout.contains("- Rust [unknown] (also: rustlang)"), "{}", stdout);

    let (_, stderr, ok) = run_garde(&config, &["extract-prompt", "claude_code:nope"]);
    assert!(!ok);
    assert!(stderr.contains("Source not found"), "{}", stderr);

    let (stdout, _, ok) = run_garde(&config, &["glossary-check"]);
    assert!(ok);
    assert!(stdout.contains("ok"), "{}", stdout);

    fs::write(
        tmp.path().join("glossary.toml"),
        "[entities.pg]\nname = \"PostgreSQL\"\n\n[entities.postgres]\nname = \"Postgres\"\naliases = [\"pg\"]\n",
    )
    .unwrap();
    let (stdout, stderr, ok) = run_garde(&config, &["glossary-check"]);
    assert!(!ok);
    assert!(stdout.contains("pg -> \"PostgreSQL\""), "{}", stdout);
    assert!(stdout.contains("\"pg\" -> pg, postgres"), "{}", stdout);
    assert!(stderr.contains("glossary has issues"), "{}", stderr);
}
