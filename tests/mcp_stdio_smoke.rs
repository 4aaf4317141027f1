use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

/// Build a throwaway Git repo with one committed file.
fn scratch_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = git2::Repository::init(dir.path()).expect("git init");

    std::fs::write(dir.path().join("a.ts"), "export const x = 1;\n").unwrap();
    std::fs::write(dir.path().join("CHANGELOG.md"), "## 1.0.0\n- first cut\n").unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(std::path::Path::new("a.ts")).unwrap();
    index.add_path(std::path::Path::new("CHANGELOG.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("Smoke", "smoke@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();

    dir
}

#[test]
fn mcp_stdio_smoke() {
    let bin = env!("CARGO_BIN_EXE_codecompass");
    let repo = scratch_repo();

    let mut child = Command::new(bin)
        .arg("--repo")
        .arg(repo.path())
        // OS-assigned port: parallel test runs must not collide.
        .env("HTTP_PORT", "0")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn codecompass");

    {
        let stdin = child.stdin.as_mut().expect("child stdin");

        // Keep each JSON-RPC message on one line (server reads by lines()).
        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/list"
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "get_changelog", "arguments": {} }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": { "name": "get_indexing_status", "arguments": {} }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "resources/read",
                "params": { "uri": "repo://structure" }
            })
        )
        .unwrap();
    }

    // Close stdin so the server loop can exit.
    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let reader = BufReader::new(stdout);

    let mut replies_by_id: HashMap<i64, serde_json::Value> = HashMap::new();
    for line in reader.lines() {
        let line = line.expect("read stdout line");
        if line.trim().is_empty() {
            continue;
        }
        let v: serde_json::Value = serde_json::from_str(&line).expect("stdout is json");
        let id = v
            .get("id")
            .and_then(|x| x.as_i64())
            .expect("json-rpc response id");
        replies_by_id.insert(id, v);
        if replies_by_id.len() >= 5 {
            break;
        }
    }

    let status = child.wait().expect("wait child");
    assert!(status.success(), "server should exit cleanly on stdin EOF");

    // initialize
    {
        let v = replies_by_id.get(&1).expect("initialize reply");
        assert_eq!(v.get("jsonrpc").and_then(|x| x.as_str()), Some("2.0"));
        let result = v.get("result").expect("initialize result");
        assert_eq!(
            result.pointer("/serverInfo/name").and_then(|x| x.as_str()),
            Some("codecompass")
        );
    }

    // tools/list
    {
        let v = replies_by_id.get(&2).expect("tools/list reply");
        let tools = v
            .pointer("/result/tools")
            .and_then(|t| t.as_array())
            .expect("tools array");
        let names: std::collections::HashSet<&str> = tools
            .iter()
            .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
            .collect();
        for required in [
            "search_code",
            "get_repository_context",
            "get_changelog",
            "agent_query",
            "request_additional_context",
            "trigger_repository_update",
        ] {
            assert!(names.contains(required), "missing tool: {required}");
        }
    }

    // get_changelog returns the committed file verbatim
    {
        let v = replies_by_id.get(&3).expect("get_changelog reply");
        assert_eq!(v.pointer("/result/isError"), Some(&serde_json::json!(false)));
        let text = v
            .pointer("/result/content/0/text")
            .and_then(|x| x.as_str())
            .expect("changelog text");
        assert!(text.contains("first cut"), "got: {text}");
    }

    // get_indexing_status returns a well-formed snapshot
    {
        let v = replies_by_id.get(&4).expect("get_indexing_status reply");
        assert_eq!(v.pointer("/result/isError"), Some(&serde_json::json!(false)));
        let text = v
            .pointer("/result/content/0/text")
            .and_then(|x| x.as_str())
            .expect("status text");
        let status: serde_json::Value = serde_json::from_str(text).expect("status is json");
        assert!(status.get("status").is_some());
        assert!(status.get("overallProgress").is_some());
    }

    // repo://structure lists the committed file
    {
        let v = replies_by_id.get(&5).expect("resources/read reply");
        let text = v
            .pointer("/result/contents/0/text")
            .and_then(|x| x.as_str())
            .expect("structure text");
        assert!(text.contains("a.ts"), "got: {text}");
    }
}
