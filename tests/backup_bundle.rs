mod test_support;

use serde_json::json;
use std::io::{Read, Write};
use test_support::{error_code, id_of, seed_school, temp_dir, Sidecar};

#[test]
fn export_then_import_restores_records_and_files() {
    let mut s = Sidecar::start("schoold-backup-roundtrip");
    let school = seed_school(&mut s, 1);
    let student = school.students[0].clone();
    let out_dir = temp_dir("schoold-backup-out");

    let source = out_dir.join("essay.txt");
    std::fs::write(&source, b"my essay").expect("write source");
    let doc = s.as_user_ok(
        &student,
        "documents.upload",
        json!({ "input": { "sourcePath": source.to_string_lossy() } }),
    );
    let kept = s.as_user_ok(
        &school.teacher,
        "grades.create",
        json!({
            "input": {
                "studentId": student,
                "subjectId": school.subject_id,
                "assignmentName": "Before backup",
                "marksObtained": 7,
                "totalMarks": 10
            }
        }),
    );

    let bundle = out_dir.join("school.zip");
    let exported = s.as_user_ok(
        &school.admin,
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"], "schoold-workspace-v1");
    assert_eq!(exported["blobCount"].as_u64(), Some(1));
    assert_eq!(exported["entryCount"].as_u64(), Some(3));

    let file = std::fs::File::open(&bundle).expect("open bundle");
    let mut zip = zip::ZipArchive::new(file).expect("read zip");
    let mut manifest = String::new();
    zip.by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains("schoold-workspace-v1"));
    assert!(zip.by_name("db/school.sqlite3").is_ok());
    assert!(zip
        .by_name(&format!("blobs/uploads/{}/essay.txt", student))
        .is_ok());

    // Diverge from the bundle.
    s.as_user_ok(&school.teacher, "grades.delete", json!({ "id": id_of(&kept) }));
    s.as_user_ok(&student, "documents.delete", json!({ "id": id_of(&doc) }));
    s.as_user_ok(
        &school.teacher,
        "grades.create",
        json!({
            "input": {
                "studentId": student,
                "subjectId": school.subject_id,
                "assignmentName": "After backup",
                "marksObtained": 3,
                "totalMarks": 10
            }
        }),
    );

    let imported = s.as_user_ok(
        &school.admin,
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(imported["bundleFormatDetected"], "schoold-workspace-v1");
    assert_eq!(imported["blobCount"].as_u64(), Some(1));

    let grades = s.as_user_ok(&school.teacher, "grades.list", json!({}));
    let names: Vec<&str> = grades["grades"]
        .as_array()
        .expect("grades")
        .iter()
        .filter_map(|g| g["assignmentName"].as_str())
        .collect();
    assert_eq!(names, vec!["Before backup"]);

    let docs = s.as_user_ok(&student, "documents.list", json!({}));
    assert_eq!(docs["files"].as_array().map(|f| f.len()), Some(1));
    let restored = s
        .workspace
        .join("blobs")
        .join("uploads")
        .join(&student)
        .join("essay.txt");
    assert_eq!(std::fs::read(&restored).expect("restored blob"), b"my essay");

    let _ = std::fs::remove_dir_all(&out_dir);
}

#[test]
fn bundles_are_admin_only_and_checked() {
    let mut s = Sidecar::start("schoold-backup-guard");
    let school = seed_school(&mut s, 0);
    let out_dir = temp_dir("schoold-backup-guard-out");
    let bundle = out_dir.join("b.zip");

    let by_head = s.as_user(
        &school.head,
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(error_code(&by_head), "forbidden");

    let no_path = s.as_user(&school.admin, "backup.exportWorkspaceBundle", json!({}));
    assert_eq!(error_code(&no_path), "bad_params");

    let missing = s.as_user(
        &school.admin,
        "backup.importWorkspaceBundle",
        json!({ "inPath": out_dir.join("absent.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let junk = out_dir.join("junk.zip");
    std::fs::write(&junk, b"not a zip").expect("write junk");
    let bad = s.as_user(
        &school.admin,
        "backup.importWorkspaceBundle",
        json!({ "inPath": junk.to_string_lossy() }),
    );
    assert_eq!(error_code(&bad), "unavailable");

    // A failed import leaves the workspace usable.
    let health = s.as_user_ok(&school.admin, "users.get", json!({ "id": school.admin }));
    assert_eq!(health["role"], "admin");

    let _ = std::fs::remove_dir_all(&out_dir);
}

fn crafted_bundle(valid: &std::path::Path, out: &std::path::Path, blob_name: &str) {
    let mut src = zip::ZipArchive::new(std::fs::File::open(valid).expect("open bundle"))
        .expect("read zip");
    let mut manifest = Vec::new();
    src.by_name("manifest.json")
        .expect("manifest entry")
        .read_to_end(&mut manifest)
        .expect("read manifest");
    let mut db = Vec::new();
    src.by_name("db/school.sqlite3")
        .expect("db entry")
        .read_to_end(&mut db)
        .expect("read db");

    let mut zip = zip::ZipWriter::new(std::fs::File::create(out).expect("create bundle"));
    let opts = zip::write::FileOptions::default();
    for (name, bytes) in [
        ("manifest.json", manifest.as_slice()),
        ("db/school.sqlite3", db.as_slice()),
        ("blobs/uploads/someone/ok.txt", b"fine".as_slice()),
        (blob_name, b"payload".as_slice()),
    ] {
        zip.start_file(name, opts).expect("start entry");
        zip.write_all(bytes).expect("write entry");
    }
    zip.finish().expect("finish bundle");
}

#[test]
fn rejected_bundle_leaves_workspace_untouched() {
    let mut s = Sidecar::start("schoold-backup-rejected");
    let school = seed_school(&mut s, 1);
    let student = school.students[0].clone();
    let out_dir = temp_dir("schoold-backup-rejected-out");

    let source = out_dir.join("essay.txt");
    std::fs::write(&source, b"my essay").expect("write source");
    s.as_user_ok(
        &student,
        "documents.upload",
        json!({ "input": { "sourcePath": source.to_string_lossy() } }),
    );
    let valid = out_dir.join("valid.zip");
    s.as_user_ok(
        &school.admin,
        "backup.exportWorkspaceBundle",
        json!({ "outPath": valid.to_string_lossy() }),
    );
    let blob = s
        .workspace
        .join("blobs")
        .join("uploads")
        .join(&student)
        .join("essay.txt");

    for (i, name) in [
        "blobs/../../escape.txt",
        "blobs/../school.sqlite3.importing",
        "blobs//abs.txt",
    ]
    .iter()
    .enumerate()
    {
        let bundle = out_dir.join(format!("crafted-{}.zip", i));
        crafted_bundle(&valid, &bundle, name);
        let resp = s.as_user(
            &school.admin,
            "backup.importWorkspaceBundle",
            json!({ "inPath": bundle.to_string_lossy() }),
        );
        assert_eq!(error_code(&resp), "unavailable", "{}", name);

        assert_eq!(std::fs::read(&blob).expect("blob survives"), b"my essay");
        assert!(!s.workspace.join("school.sqlite3.importing").exists());
        assert!(!s.workspace.join("blobs.importing").exists());
        assert!(!s.workspace.join("blobs").join("uploads").join("someone").exists());
        let parent = s.workspace.parent().expect("workspace parent");
        assert!(!parent.join("escape.txt").exists());
    }

    let docs = s.as_user_ok(&student, "documents.list", json!({}));
    assert_eq!(docs["files"].as_array().map(|f| f.len()), Some(1));

    let _ = std::fs::remove_dir_all(&out_dir);
}
