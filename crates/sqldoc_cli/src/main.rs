//! CLI walkthrough of a session lifecycle against a SQLite file.
//!
//! # Responsibility
//! - Create a store schema, write posts in sessions, print reduce results.
//! - Keep output deterministic for quick local sanity checks.
//!
//! Usage: `sqldoc_cli [database-path]`. Without a path a fresh file under the
//! system temp directory is used. `SQLDOC_LOG_DIR` enables file logging.

use log::info;
use serde::{Deserialize, Serialize};
use sqldoc_core::{
    handle, Accessor, Column, Entity, Handle, Index, IndexDescriptor, ReduceIndex, SchemaBuilder,
    Store, StoreConfig, StoreResult,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct Post {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    version: i64,
    author: String,
    title: String,
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

#[derive(Debug, Serialize, Deserialize)]
struct PostsByAuthor {
    #[serde(rename = "Id", default)]
    id: i64,
    #[serde(rename = "Author")]
    author: String,
    #[serde(rename = "Count")]
    count: i64,
}

impl Index for PostsByAuthor {
    const INDEX_TYPE: &'static str = "PostsByAuthor";
}

impl ReduceIndex for PostsByAuthor {
    const GROUP_KEY: &'static str = "Author";

    fn reduce(group: Vec<Self>) -> Option<Self> {
        let author = group.first()?.author.clone();
        Some(Self {
            id: 0,
            author,
            count: group.iter().map(|entry| entry.count).sum(),
        })
    }

    fn delete(self, removed: Vec<Self>) -> Option<Self> {
        let count = self.count - removed.iter().map(|entry| entry.count).sum::<i64>();
        (count > 0).then_some(Self { count, ..self })
    }
}

fn posts_by_author() -> IndexDescriptor {
    IndexDescriptor::reduce(|post: &Post| {
        vec![PostsByAuthor {
            id: 0,
            author: post.author.clone(),
            count: 1,
        }]
    })
}

fn new_post(author: &str, title: &str) -> Handle<Post> {
    handle(Post {
        id: 0,
        version: 0,
        author: author.to_string(),
        title: title.to_string(),
    })
}

fn database_path() -> PathBuf {
    match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => std::env::temp_dir().join(format!("sqldoc-{}.db", std::process::id())),
    }
}

fn print_counts(store: &Store) -> StoreResult<()> {
    let conn = store.connect()?;
    let dialect = store.dialect();
    let sql = format!(
        "SELECT {author}, {count} FROM {table} ORDER BY {author};",
        author = dialect.quote_for_column_name("Author"),
        count = dialect.quote_for_column_name("Count"),
        table = dialect.quote_for_table_name(&store.index_table("PostsByAuthor", "")),
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let author: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        println!("  {author}: {count}");
    }
    Ok(())
}

fn run(path: PathBuf) -> StoreResult<()> {
    let store: Arc<Store> = Store::open(StoreConfig::sqlite(&path).with_index(posts_by_author()))?;
    {
        let conn = store.connect()?;
        let schema = SchemaBuilder::new(&store, &conn);
        schema.create_document_table("")?;
        schema.create_reduce_index_table(
            "PostsByAuthor",
            "",
            &[Column::text("Author"), Column::integer("Count")],
        )?;
    }
    store.initialize()?;
    info!("event=cli_run module=cli status=start path={}", path.display());

    let first = new_post("ada", "Notes on the engine");
    let second = new_post("ada", "Sketch of a program");
    let third = new_post("grace", "Compilers");
    {
        let mut session = store.create_session();
        session.save(&first)?;
        session.save(&second)?;
        session.save(&third)?;
        session.commit()?;
    }
    println!("after insert:");
    print_counts(&store)?;

    {
        let mut session = store.create_session();
        let loaded = session.get::<Post>(&[second.borrow().id])?;
        for post in &loaded {
            session.delete(post)?;
        }
        session.commit()?;
    }
    println!("after delete:");
    print_counts(&store)?;

    let mut session = store.create_session();
    let posts = session.list::<Post>(0, 10)?;
    println!("documents:");
    for post in &posts {
        let post = post.borrow();
        println!("  #{} v{} {} by {}", post.id, post.version, post.title, post.author);
    }
    session.commit()?;
    Ok(())
}

fn main() -> ExitCode {
    if let Ok(log_dir) = std::env::var("SQLDOC_LOG_DIR") {
        if let Err(err) = sqldoc_core::init_logging(sqldoc_core::default_log_level(), log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    println!("sqldoc_core version={}", sqldoc_core::core_version());
    match run(database_path()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sqldoc_cli failed: {err}");
            ExitCode::FAILURE
        }
    }
}
