mod common;

use common::{post, setup, Post};
use serde::{Deserialize, Serialize};
use sqldoc_core::{Column, Index, IndexDescriptor, SchemaBuilder};

#[test]
fn map_rows_follow_document_updates_and_deletes() {
    let fixture = setup();
    let item = post(1, "first title");
    {
        let mut session = fixture.store.create_session();
        session.save(&item).unwrap();
        session.commit().unwrap();
    }
    let id = item.borrow().id;
    assert_eq!(fixture.titles(), vec![(id, "first title".to_string())]);

    {
        let mut session = fixture.store.create_session();
        let loaded = session.get::<Post>(&[id]).unwrap();
        loaded[0].borrow_mut().title = "second title".to_string();
        session.save(&loaded[0]).unwrap();
        session.commit().unwrap();
    }
    assert_eq!(fixture.titles(), vec![(id, "second title".to_string())]);

    {
        let mut session = fixture.store.create_session();
        let loaded = session.get::<Post>(&[id]).unwrap();
        session.delete(&loaded[0]).unwrap();
        session.commit().unwrap();
    }
    assert!(fixture.titles().is_empty());
    assert_eq!(fixture.document_count(), 0);
}

#[test]
fn delete_uses_persisted_content_not_local_changes() {
    let fixture = setup();
    let item = post(42, "persisted");
    {
        let mut session = fixture.store.create_session();
        session.save(&item).unwrap();
        session.commit().unwrap();
    }

    let mut session = fixture.store.create_session();
    let loaded = session.get::<Post>(&[item.borrow().id]).unwrap();
    loaded[0].borrow_mut().post_id = 7;
    session.delete(&loaded[0]).unwrap();
    session.commit().unwrap();

    assert_eq!(fixture.stats_rows(), 0);
    assert!(fixture.titles().is_empty());
}

#[derive(Serialize, Deserialize)]
struct PostByGroup {
    #[serde(rename = "PostId")]
    post_id: i64,
    #[serde(rename = "Pinned")]
    pinned: bool,
}

impl Index for PostByGroup {
    const INDEX_TYPE: &'static str = "PostByGroup";
}

#[test]
fn session_registered_index_is_written_alongside_store_indexes() {
    let fixture = setup();
    {
        let conn = fixture.conn();
        SchemaBuilder::new(&fixture.store, &conn)
            .create_map_index_table(
                "PostByGroup",
                "",
                &[Column::integer("PostId"), Column::integer("Pinned")],
            )
            .unwrap();
    }

    let mut session = fixture.store.create_session();
    session
        .register_indexes([IndexDescriptor::map(|post: &Post| {
            vec![PostByGroup {
                post_id: post.post_id,
                pinned: post.title.starts_with('!'),
            }]
        })])
        .unwrap();
    session.save(&post(3, "!pinned")).unwrap();
    session.save(&post(3, "plain")).unwrap();
    session.commit().unwrap();

    assert_eq!(
        fixture.count("SELECT COUNT(*) FROM \"PostByGroup\" WHERE \"PostId\" = 3"),
        2
    );
    assert_eq!(
        fixture.count("SELECT COUNT(*) FROM \"PostByGroup\" WHERE \"Pinned\" = 1"),
        1
    );
    assert_eq!(fixture.titles().len(), 2);
}
