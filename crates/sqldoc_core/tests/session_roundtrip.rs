mod common;

use common::{post, setup, Comment, Post, DRAFTS};
use sqldoc_core::{handle, SaveOptions, StoreError};
use std::rc::Rc;

#[test]
fn save_assigns_id_and_get_returns_same_instance() {
    let fixture = setup();
    let mut session = fixture.store.create_session();

    let first = post(42, "hello");
    session.save(&first).unwrap();
    let id = first.borrow().id;
    assert!(id > 0);

    let loaded = session.get::<Post>(&[id]).unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(Rc::ptr_eq(&loaded[0], &first));
    assert_eq!(first.borrow().version, 1);
    session.commit().unwrap();
}

#[test]
fn new_session_loads_equal_copy() {
    let fixture = setup();
    let original = post(42, "hello");
    {
        let mut session = fixture.store.create_session();
        session.save(&original).unwrap();
        session.commit().unwrap();
    }

    let id = original.borrow().id;
    let mut session = fixture.store.create_session();
    let loaded = session.get::<Post>(&[id]).unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(!Rc::ptr_eq(&loaded[0], &original));
    assert_eq!(*loaded[0].borrow(), *original.borrow());

    let again = session.get::<Post>(&[id]).unwrap();
    assert!(Rc::ptr_eq(&loaded[0], &again[0]));
}

#[test]
fn second_flush_without_changes_runs_no_commands() {
    let fixture = setup();
    let mut session = fixture.store.create_session();
    session.save(&post(42, "hello")).unwrap();
    session.flush().unwrap();
    let after_first = session.executed_commands();
    assert!(after_first > 0);

    session.flush().unwrap();
    assert_eq!(session.executed_commands(), after_first);
    session.commit().unwrap();
    assert_eq!(fixture.document_count(), 1);
}

#[test]
fn mutating_a_saved_object_is_flushed_on_commit() {
    let fixture = setup();
    let item = post(42, "draft");
    let mut session = fixture.store.create_session();
    session.save(&item).unwrap();
    session.flush().unwrap();

    item.borrow_mut().title = "final".to_string();
    session.commit().unwrap();

    let id = item.borrow().id;
    let mut reader = fixture.store.create_session();
    let loaded = reader.get::<Post>(&[id]).unwrap();
    assert_eq!(loaded[0].borrow().title, "final");
}

#[test]
fn get_keeps_request_order_and_skips_missing_and_foreign_types() {
    let fixture = setup();
    let a = post(1, "a");
    let b = post(2, "b");
    let comment = handle(Comment {
        body: "nice".to_string(),
    });
    {
        let mut session = fixture.store.create_session();
        session.save(&a).unwrap();
        session.save(&comment).unwrap();
        session.save(&b).unwrap();
        session.commit().unwrap();
    }
    let (a_id, b_id) = (a.borrow().id, b.borrow().id);
    let comment_id = b_id - 1;

    let mut session = fixture.store.create_session();
    let loaded = session
        .get::<Post>(&[b_id, 9_999, comment_id, a_id])
        .unwrap();
    let titles = loaded
        .iter()
        .map(|post| post.borrow().title.clone())
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["b", "a"]);

    let comments = session.get::<Comment>(&[comment_id]).unwrap();
    assert_eq!(comments[0].borrow().body, "nice");
}

#[test]
fn second_instance_for_tracked_id_is_rejected() {
    let fixture = setup();
    let original = post(42, "hello");
    {
        let mut session = fixture.store.create_session();
        session.save(&original).unwrap();
        session.commit().unwrap();
    }
    let id = original.borrow().id;

    let mut session = fixture.store.create_session();
    let _loaded = session.get::<Post>(&[id]).unwrap();

    let duplicate = handle(original.borrow().clone());
    let err = session.save(&duplicate).unwrap_err();
    assert!(matches!(err, StoreError::InvalidOperation(_)));
}

#[test]
fn saving_object_with_unknown_id_fails_on_flush() {
    let fixture = setup();
    let ghost = post(42, "ghost");
    ghost.borrow_mut().id = 9_999;

    let mut session = fixture.store.create_session();
    session.save(&ghost).unwrap();
    let err = session.flush().unwrap_err();
    assert!(matches!(err, StoreError::InvalidOperation(_)));
    assert!(session.is_cancelled());
}

#[test]
fn list_pages_documents_of_one_type_by_id() {
    let fixture = setup();
    {
        let mut session = fixture.store.create_session();
        for n in 0..5 {
            session.save(&post(n, &format!("post {n}"))).unwrap();
        }
        session
            .save(&handle(Comment {
                body: "skip me".to_string(),
            }))
            .unwrap();
        session.commit().unwrap();
    }

    let mut session = fixture.store.create_session();
    let first = session.list::<Post>(0, 2).unwrap();
    let titles = first
        .iter()
        .map(|post| post.borrow().title.clone())
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["post 0", "post 1"]);

    let last = session.list::<Post>(4, 2).unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].borrow().title, "post 4");

    let again = session.list::<Post>(0, 1).unwrap();
    assert!(Rc::ptr_eq(&again[0], &first[0]));
}

#[test]
fn named_collection_has_its_own_table_and_identity_map() {
    let fixture = setup();
    let draft = post(42, "draft");
    {
        let mut session = fixture.store.create_session();
        session
            .save_with(
                &draft,
                SaveOptions {
                    collection: DRAFTS.to_string(),
                    ..SaveOptions::default()
                },
            )
            .unwrap();
        session.commit().unwrap();
    }
    let id = draft.borrow().id;

    assert_eq!(fixture.document_count(), 0);
    assert_eq!(fixture.count("SELECT COUNT(*) FROM \"Drafts_Document\""), 1);

    let mut session = fixture.store.create_session();
    assert!(session.get::<Post>(&[id]).unwrap().is_empty());
    let loaded = session.get_in::<Post>(&[id], DRAFTS).unwrap();
    assert_eq!(loaded[0].borrow().title, "draft");
}
