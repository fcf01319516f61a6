#![allow(dead_code)]

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sqldoc_core::{
    handle, Accessor, Column, Entity, Handle, Index, IndexDescriptor, ReduceIndex, SchemaBuilder,
    Store, StoreConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

pub const DRAFTS: &str = "Drafts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub version: i64,
    pub post_id: i64,
    pub title: String,
}

impl Entity for Post {
    const TYPE_NAME: &'static str = "Post";

    fn id_accessor() -> Option<Accessor<Self>> {
        Some(Accessor::new(|post: &Self| post.id, |post: &mut Self, id| post.id = id))
    }

    fn version_accessor() -> Option<Accessor<Self>> {
        Some(Accessor::new(
            |post: &Self| post.version,
            |post: &mut Self, version| post.version = version,
        ))
    }
}

/// Entity without accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub body: String,
}

impl Entity for Comment {
    const TYPE_NAME: &'static str = "Comment";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostStats {
    #[serde(rename = "Id", default)]
    pub id: i64,
    #[serde(rename = "PostId")]
    pub post_id: i64,
    #[serde(rename = "Count")]
    pub count: i64,
}

impl Index for PostStats {
    const INDEX_TYPE: &'static str = "PostStats";
}

impl ReduceIndex for PostStats {
    const GROUP_KEY: &'static str = "PostId";

    fn reduce(group: Vec<Self>) -> Option<Self> {
        let post_id = group.first()?.post_id;
        Some(Self {
            id: 0,
            post_id,
            count: group.iter().map(|stats| stats.count).sum(),
        })
    }

    fn delete(self, removed: Vec<Self>) -> Option<Self> {
        let count = self.count - removed.iter().map(|stats| stats.count).sum::<i64>();
        (count > 0).then_some(Self { count, ..self })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostByTitle {
    #[serde(rename = "Title")]
    pub title: String,
}

impl Index for PostByTitle {
    const INDEX_TYPE: &'static str = "PostByTitle";
}

pub fn post_stats_index() -> IndexDescriptor {
    IndexDescriptor::reduce(|post: &Post| {
        vec![PostStats {
            id: 0,
            post_id: post.post_id,
            count: 1,
        }]
    })
}

pub fn post_by_title_index() -> IndexDescriptor {
    IndexDescriptor::map(|post: &Post| {
        vec![PostByTitle {
            title: post.title.clone(),
        }]
    })
}

pub fn post(post_id: i64, title: &str) -> Handle<Post> {
    handle(Post {
        id: 0,
        version: 0,
        post_id,
        title: title.to_string(),
    })
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<Store>,
}

impl Fixture {
    pub fn conn(&self) -> Connection {
        self.store.connect().unwrap()
    }

    pub fn count(&self, sql: &str) -> i64 {
        self.conn().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    pub fn document_count(&self) -> i64 {
        self.count("SELECT COUNT(*) FROM \"Document\"")
    }

    /// `Count` of the persisted `PostStats` row for `post_id`.
    pub fn stats_count(&self, post_id: i64) -> Option<i64> {
        self.conn()
            .query_row(
                "SELECT \"Count\" FROM \"PostStats\" WHERE \"PostId\" = ?1",
                [post_id],
                |row| row.get(0),
            )
            .optional()
            .unwrap()
    }

    pub fn stats_rows(&self) -> i64 {
        self.count("SELECT COUNT(*) FROM \"PostStats\"")
    }

    /// Document ids linked to the `PostStats` row of `post_id`.
    pub fn linked_documents(&self, post_id: i64) -> Vec<i64> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT b.\"DocumentId\" FROM \"PostStats_Document\" b
                 JOIN \"PostStats\" s ON s.\"Id\" = b.\"PostStatsId\"
                 WHERE s.\"PostId\" = ?1 ORDER BY b.\"DocumentId\"",
            )
            .unwrap();
        let ids = stmt
            .query_map([post_id], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<i64>, _>>()
            .unwrap();
        ids
    }

    pub fn bridge_rows(&self) -> i64 {
        self.count("SELECT COUNT(*) FROM \"PostStats_Document\"")
    }

    pub fn titles(&self) -> Vec<(i64, String)> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT \"DocumentId\", \"Title\" FROM \"PostByTitle\" ORDER BY \"DocumentId\"")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    }

    pub fn document_version(&self, id: i64) -> i64 {
        self.conn()
            .query_row(
                "SELECT \"Version\" FROM \"Document\" WHERE \"Id\" = ?1",
                [id],
                |row| row.get(0),
            )
            .unwrap()
    }
}

/// Store with `PostStats` and `PostByTitle` registered, schema created and
/// ids seeded.
pub fn setup() -> Fixture {
    setup_with(|config| config)
}

pub fn setup_with(configure: impl FnOnce(StoreConfig) -> StoreConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::sqlite(dir.path().join("store.db"))
        .with_collection(DRAFTS)
        .with_index(post_stats_index())
        .with_index(post_by_title_index());
    let store = Store::open(configure(config)).unwrap();

    let conn = store.connect().unwrap();
    let schema = SchemaBuilder::new(&store, &conn);
    for collection in ["", DRAFTS] {
        schema.create_document_table(collection).unwrap();
        schema
            .create_reduce_index_table(
                "PostStats",
                collection,
                &[Column::integer("PostId"), Column::integer("Count")],
            )
            .unwrap();
        schema
            .create_map_index_table("PostByTitle", collection, &[Column::text("Title")])
            .unwrap();
    }
    drop(conn);
    store.initialize().unwrap();

    Fixture { dir, store }
}
