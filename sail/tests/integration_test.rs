use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

fn create_workspace(root: &Path) {
    for (name, deps) in [("utils", ""), ("app", r#""utils": "^1.0.0""#)] {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/index.txt"), format!("{} source\n", name)).unwrap();
        fs::write(
            dir.join("package.json"),
            format!(
                r#"{{
                    "name": "{}",
                    "version": "1.0.0",
                    "scripts": {{ "build": "mkdir -p dist && cat src/index.txt > dist/out.txt" }},
                    "dependencies": {{ {} }}
                }}"#,
                name, deps
            ),
        )
        .unwrap();
    }
    fs::write(root.join("package-lock.json"), "{}").unwrap();
    fs::write(
        root.join("sail.config.json"),
        r#"{
            "version": 1,
            "tasks": {
                "build": {
                    "dependsOn": ["^build"],
                    "inputGlobs": ["src/**"],
                    "outputGlobs": ["dist/**"]
                }
            }
        }"#,
    )
    .unwrap();
}

fn sail(root: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_sail"))
        .arg("--dir")
        .arg(root)
        .args(args)
        .arg("--quiet")
        .output()
        .expect("failed to run sail")
}

#[test]
fn test_build_then_rebuild_is_up_to_date() {
    let tmp = TempDir::new().unwrap();
    create_workspace(tmp.path());

    let first = sail(tmp.path(), &["build"]);
    assert!(first.status.success(), "{:?}", first);
    assert!(tmp.path().join("app/dist/out.txt").is_file());

    let second = sail(tmp.path(), &["build"]);
    assert!(second.status.success());
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(stdout.contains("nothing to do"), "{}", stdout);
}

#[test]
fn test_failing_task_exits_non_zero() {
    let tmp = TempDir::new().unwrap();
    create_workspace(tmp.path());
    let manifest = tmp.path().join("utils/package.json");
    let raw = fs::read_to_string(&manifest)
        .unwrap()
        .replace("mkdir -p dist && cat src/index.txt > dist/out.txt", "exit 1");
    fs::write(&manifest, raw).unwrap();

    let output = sail(tmp.path(), &["build"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("utils#build"), "{}", stderr);
}

#[test]
fn test_scan_lists_packages() {
    let tmp = TempDir::new().unwrap();
    create_workspace(tmp.path());

    let output = sail(tmp.path(), &["scan"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("utils"));
    assert!(stdout.contains("app"));
    assert!(stdout.contains("app#build"));
}

#[test]
fn test_scan_infer_works_without_config() {
    let tmp = TempDir::new().unwrap();
    create_workspace(tmp.path());
    fs::remove_file(tmp.path().join("sail.config.json")).unwrap();

    let output = sail(tmp.path(), &["scan", "--infer"]);
    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Scripts become implicit tasks with no dependency edges.
    assert!(stdout.contains("utils#build"), "{}", stdout);
}

#[test]
fn test_scan_json_emits_packages() {
    let tmp = TempDir::new().unwrap();
    create_workspace(tmp.path());

    let output = sail(tmp.path(), &["scan", "--json"]);
    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("scan --json emits valid JSON");
    assert_eq!(parsed["packages"].as_array().unwrap().len(), 2);
}

#[test]
fn test_empty_workspace_exits_zero() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("package-lock.json"), "{}").unwrap();

    let output = sail(tmp.path(), &["build"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("no tasks"), "{}", stdout);
}
