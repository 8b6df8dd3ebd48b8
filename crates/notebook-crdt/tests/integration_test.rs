#![cfg(feature = "client")]

//! Live checks against a Jupyter server running jupyter-server-documents:
//!
//!   uv run --with jupyter-server --with jupyter-server-documents \
//!     jupyter server --port 18888 --IdentityProvider.token=testtoken123 --no-browser
//!
//! and a file id from
//!
//!   curl -X POST "http://localhost:18888/api/fileid/index?token=testtoken123&path=test.ipynb"

use std::time::Duration;

use notebook_crdt::{build_room_url, cell_types, ClientConfig, NotebookDoc, RoomClient, RoomId, SyncState};

const SERVER: &str = "http://localhost:18888";
const TOKEN: &str = "testtoken123";

fn file_id() -> String {
    std::env::var("NOTEBOOK_FILE_ID").unwrap_or_else(|_| "dcd20096-cdcf-409e-8ad5-2115c531ddfe".into())
}

#[tokio::test]
#[ignore]
async fn test_sync_with_notebook_room() {
    let url = build_room_url(SERVER, &RoomId::notebook(file_id()));
    let mut room = RoomClient::connect(ClientConfig::new(url).with_token(TOKEN))
        .await
        .expect("connect");

    let doc = NotebookDoc::new();
    room.sync(&doc).await.expect("sync");
    assert_eq!(room.sync_state(), SyncState::Synced);

    room.close().await.expect("close");
}

#[tokio::test]
#[ignore]
async fn test_published_edit_reaches_second_replica() {
    let url = build_room_url(SERVER, &RoomId::notebook(file_id()));

    let writer_doc = NotebookDoc::new();
    let mut writer = RoomClient::connect(ClientConfig::new(url.clone()).with_token(TOKEN))
        .await
        .expect("connect writer");
    writer.sync(&writer_doc).await.expect("sync writer");

    let at = writer_doc
        .add_cell("live-test", cell_types::MARKDOWN, "written by a test", None)
        .expect("add cell");
    writer.publish(&writer_doc).await.expect("publish");

    let reader_doc = NotebookDoc::new();
    let mut reader = RoomClient::connect(ClientConfig::new(url).with_token(TOKEN))
        .await
        .expect("connect reader");
    reader.sync(&reader_doc).await.expect("sync reader");
    reader.pull(&reader_doc, Duration::from_millis(200)).await.expect("pull");

    assert_eq!(reader_doc.cell_source(at).expect("cell"), "written by a test");

    writer_doc.remove_cell(at).expect("cleanup");
    writer.publish(&writer_doc).await.expect("publish cleanup");
}
