//! Background listing and filtered view step definitions.

use std::sync::Arc;

use cucumber::gherkin::Step;
use cucumber::{given, then, when, World};
use tio_client::test_utils::MockServer;
use tio_client::{
    Connection, DataContainer, Listing, MaterializedView, Record, Row, ViewUpdate,
};

/// Test context for listing scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct ListingWorld {
    server: Option<MockServer>,
    connection: Option<Connection>,
    listing: Listing,
    view: Option<MaterializedView>,
    last_update: Option<ViewUpdate>,
}

impl std::fmt::Debug for ListingWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListingWorld")
            .field("server", &self.server.as_ref().map(|s| s.port()))
            .field("rows", &self.listing.len())
            .field("filter", &self.view.as_ref().and_then(|v| v.filter()))
            .field("last_update", &self.last_update)
            .finish()
    }
}

impl ListingWorld {
    fn new() -> Self {
        Self {
            server: None,
            connection: None,
            listing: Listing::new(),
            view: None,
            last_update: None,
        }
    }

    fn view(&mut self) -> &mut MaterializedView {
        self.view.as_mut().expect("listing has not completed")
    }
}

/// Rows of a `| key | value |` table, header skipped.
fn table_rows(step: &Step) -> Vec<Row> {
    let table = step.table.as_ref().expect("step needs a table");
    table
        .rows
        .iter()
        .skip(1)
        .map(|cells| Row::new(cells[0].as_str(), cells[1].as_str()))
        .collect()
}

// --- Given steps ---

#[given("a running tio server")]
async fn given_server(world: &mut ListingWorld) {
    tio_client::utils::bootstrap::try_init_tracing();
    world.server = Some(MockServer::start().await.expect("start server"));
}

#[given("the server lists containers:")]
async fn given_containers(world: &mut ListingWorld, step: &Step) {
    let records = table_rows(step)
        .into_iter()
        .map(|row| Record::new(row.key, row.value));
    world
        .server
        .as_ref()
        .expect("no server started")
        .seed("meta/containers", "volatile_map", records);
}

#[given(expr = "the listing of {string} has completed")]
async fn given_listing_completed(world: &mut ListingWorld, name: String) {
    let server = world.server.as_ref().expect("no server started");
    let connection = Connection::connect(&server.host(), server.port())
        .await
        .expect("connect");
    let container: Arc<dyn DataContainer> =
        Arc::new(connection.open(&name, "").await.expect("open"));

    assert!(world.listing.start(container));
    world.listing.finished().await;
    assert!(world.listing.last_error().is_none());

    let mut view = world.listing.view();
    view.refresh();
    world.view = Some(view);
    world.connection = Some(connection);
}

// --- When steps ---

#[when(regex = r#"^the filter is set to "(.*)"$"#)]
async fn when_filter_set(world: &mut ListingWorld, text: String) {
    let view = world.view();
    view.set_filter(&text);
    let update = view.refresh();
    world.last_update = Some(update);
}

// --- Then steps ---

#[then("the view shows exactly:")]
async fn then_view_shows(world: &mut ListingWorld, step: &Step) {
    let expected = table_rows(step);
    assert_eq!(world.view().rows(), expected.as_slice());
}

#[then(expr = "the view shows {int} rows")]
async fn then_view_count(world: &mut ListingWorld, count: usize) {
    assert_eq!(world.view().rows().len(), count);
}

#[then(expr = "the status reads {string}")]
async fn then_status(world: &mut ListingWorld, status: String) {
    assert_eq!(world.view().status().to_string(), status);
}

#[then("the last refresh changed nothing")]
async fn then_no_change(world: &mut ListingWorld) {
    let update = world.last_update.as_ref().expect("no refresh yet");
    assert!(update.is_noop(), "got {:?}", update);
}
