//! End-to-end coverage of the virtual node tree against a scripted remote,
//! exercising the scenarios a real mount walks through: semester/course
//! listing, recursive folder expansion, and sibling-name disambiguation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use studip_core::crawler::fake::FakeRemoteSource;
use studip_core::{Course, Crawler, File, Folder, NodeId, Resolver, Semester, Template};

fn semester(id: &str, title: &str, begin: chrono::DateTime<Utc>) -> Semester {
    Semester { id: id.into(), title: title.into(), begin, end: begin }
}

fn course(id: &str, title: &str) -> Course {
    Course {
        id: id.into(),
        title: title.into(),
        number: String::new(),
        subtitle: String::new(),
        description: String::new(),
        group: String::new(),
        location: String::new(),
        class: String::new(),
        course_type: String::new(),
        type_short: String::new(),
        semester_ids: vec![],
    }
}

fn folder(id: &str, name: &str, course_id: &str, children: Vec<&str>, files: Vec<&str>) -> Folder {
    Folder {
        id: id.into(),
        name: name.into(),
        parent_folder_id: None,
        course_id: course_id.into(),
        child_folder_ids: children.into_iter().map(String::from).collect(),
        child_file_ids: files.into_iter().map(String::from).collect(),
    }
}

fn file(id: &str, name: &str, folder_id: &str) -> File {
    File {
        id: id.into(),
        name: name.into(),
        description: String::new(),
        size: 1024,
        mime_type: "application/pdf".into(),
        storage: "disk".into(),
        terms: String::new(),
        downloads: 0,
        content_hash: studip_core::entity::ContentHash::from_size_mtime(1024, Utc::now()),
        download_url: String::new(),
        folder_id: folder_id.into(),
    }
}

#[tokio::test]
async fn short_path_flattens_the_generic_root_and_mirrors_subfolders() {
    // Course "c1" has a top-level "Allgemeiner Dateiordner" (a generic root)
    // containing one file directly and one subfolder "Folien" with its own
    // file — the shape exercised by scenario 3.
    let top = folder("top", "Allgemeiner Dateiordner", "c1", vec!["sub"], vec!["f1"]);
    let sub = folder("sub", "Folien", "c1", vec![], vec!["f2"]);

    let mut folders = HashMap::new();
    folders.insert("top".to_string(), (vec![sub.clone()], vec![file("f1", "readme.pdf", "top")]));
    folders.insert("sub".to_string(), (vec![], vec![file("f2", "slides.pdf", "sub")]));

    let mut courses = HashMap::new();
    courses.insert("s1".to_string(), vec![course("c1", "Networking")]);

    let fake = FakeRemoteSource {
        semesters: vec![semester("s1", "SS 2019", Utc::now())],
        courses,
        top_folders: HashMap::from([("c1".to_string(), top)]),
        folders,
        ..Default::default()
    };
    let crawler = Arc::new(Crawler::new(fake, 4));
    let template = Template::compile("{semester-lexical-short}/{course}/{short-path}").unwrap();
    let resolver = Resolver::new(template, crawler, studip_core::token::default_generic_roots());

    let semesters = resolver.readdir(NodeId::ROOT).await.unwrap();
    let (_, semester_node) = &semesters[0];
    let courses = resolver.readdir(*semester_node).await.unwrap();
    let (_, course_node) = &courses[0];

    // The generic root itself must not appear as a directory: its children
    // (readme.pdf and the Folien subfolder) show up directly.
    let entries = resolver.readdir(*course_node).await.unwrap();
    let names: Vec<_> = entries.iter().map(|(n, _)| n.clone()).collect();
    assert!(names.contains(&"readme.pdf".to_string()));
    assert!(names.contains(&"Folien".to_string()));
    assert!(!names.iter().any(|n| n.contains("Allgemeiner")));

    let folien_id = entries.iter().find(|(n, _)| n == "Folien").unwrap().1;
    let folien_children = resolver.readdir(folien_id).await.unwrap();
    assert_eq!(folien_children.len(), 1);
    assert_eq!(folien_children[0].0, "slides.pdf");
}

#[tokio::test]
async fn colliding_course_abbreviations_are_disambiguated_with_an_id_suffix() {
    // Both titles reduce to the abbreviation "AuD" (first letter of each
    // word), so the two courses collide and must be disambiguated.
    let mut courses = HashMap::new();
    courses.insert(
        "s1".to_string(),
        vec![
            course("c1", "Algorithmen und Datenstrukturen"),
            course("c2", "Algorithmen und Deduktion"),
        ],
    );
    let fake = FakeRemoteSource {
        semesters: vec![semester("s1", "WS 2018/19", Utc::now())],
        courses,
        ..Default::default()
    };
    let crawler = Arc::new(Crawler::new(fake, 4));
    let template = Template::compile("{semester-lexical-short}/{course-abbrev}").unwrap();
    let resolver = Resolver::new(template, crawler, studip_core::token::default_generic_roots());

    let semesters = resolver.readdir(NodeId::ROOT).await.unwrap();
    let (_, semester_node) = &semesters[0];
    let entries = resolver.readdir(*semester_node).await.unwrap();
    let names: Vec<_> = entries.iter().map(|(n, _)| n.clone()).collect();

    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| n.starts_with("AuD")));
    assert!(names.iter().any(|n| n.contains("(c1")));
    assert!(names.iter().any(|n| n.contains("(c2")));
}

#[tokio::test]
async fn readdir_ordering_is_lexicographic_regardless_of_remote_order() {
    let mut courses = HashMap::new();
    courses.insert(
        "s1".to_string(),
        vec![course("c3", "Zoology"), course("c1", "Algebra"), course("c2", "Mechanics")],
    );
    let fake = FakeRemoteSource {
        semesters: vec![semester("s1", "SS 2020", Utc::now())],
        courses,
        ..Default::default()
    };
    let crawler = Arc::new(Crawler::new(fake, 4));
    let template = Template::compile("{semester-lexical-short}/{course}").unwrap();
    let resolver = Resolver::new(template, crawler, studip_core::token::default_generic_roots());

    let semesters = resolver.readdir(NodeId::ROOT).await.unwrap();
    let (_, semester_node) = &semesters[0];
    let entries = resolver.readdir(*semester_node).await.unwrap();
    let names: Vec<_> = entries.iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["Algebra".to_string(), "Mechanics".to_string(), "Zoology".to_string()]);
}
