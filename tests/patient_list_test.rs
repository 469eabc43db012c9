//! Patient list pagination tests using wiremock
//!
//! Walks a three-page search through server-provided `next` links and checks
//! the merged ordering, sections, and status events along the way.

mod common;

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use smartfhir::patients::{
    ListStatus, PatientList, PatientListOrder, PatientListQuery, PatientSearch, PLACEHOLDER_TITLE,
};

async fn mount_pages(server: &MockServer) {
    let page2 = format!("{}/fhir/Patient?_page=2", server.uri());
    let page3 = format!("{}/fhir/Patient?_page=3", server.uri());

    Mock::given(method("GET"))
        .and(path("/fhir/Patient"))
        .and(query_param("_page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::bundle(
            vec![
                common::patient("p3", "Cy", "Adams", "1981-01-01"),
                common::patient("p4", "Di", "Young", "1982-01-01"),
            ],
            Some(5),
            Some(&page3),
        )))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient"))
        .and(query_param("_page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::bundle(
            vec![common::patient("p5", "Ed", "Baker", "1983-01-01")],
            Some(5),
            None,
        )))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient"))
        .and(query_param("_sort", "family:asc,given:asc,birthdate:asc"))
        .and(query_param("_count", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::bundle(
            vec![
                common::patient("p1", "Al", "Baker", "1980-01-01"),
                common::patient("p2", "Bo", "Xu", "1979-01-01"),
            ],
            Some(5),
            Some(&page2),
        )))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_list_follows_next_links_until_exhausted() {
    let server = MockServer::start().await;
    mount_pages(&server).await;

    let query = PatientListQuery::all(PatientListOrder::ByFamilyNameAsc).with_page_size(2);
    let list = PatientList::new(common::unsigned_gateway(&server), query);
    let mut events = list.subscribe();

    list.retrieve().await;
    assert_eq!(events.recv().await.unwrap().status, ListStatus::Loading);
    assert_eq!(events.recv().await.unwrap().status, ListStatus::Ready);
    assert_eq!((list.actual_count(), list.expected_count()), (2, 5));
    assert!(list.has_more());

    let sections = list.sections();
    let last = sections.last().unwrap();
    assert_eq!(last.title, PLACEHOLDER_TITLE);
    assert!(last.placeholder);
    assert_eq!((last.offset, last.len), (2, 3));

    list.retrieve_more().await;
    list.retrieve_more().await;
    assert!(!list.has_more());
    assert_eq!(list.actual_count(), 5);

    let ids: Vec<_> = list
        .patients()
        .iter()
        .map(|p| p.id().unwrap().to_string())
        .collect();
    assert_eq!(ids, ["p3", "p1", "p5", "p2", "p4"]);

    let titles: Vec<_> = list
        .sections()
        .into_iter()
        .map(|s| (s.title, s.len, s.placeholder))
        .collect();
    assert_eq!(
        titles,
        [
            ("A".to_string(), 1, false),
            ("B".to_string(), 2, false),
            ("X".to_string(), 1, false),
            ("Y".to_string(), 1, false),
        ]
    );

    // A further request is a no-op
    list.retrieve_more().await;
    assert_eq!(list.actual_count(), 5);
    while let Ok(event) = events.try_recv() {
        assert!(event.error.is_none());
    }
}

#[tokio::test]
async fn test_search_cursor_reports_done_and_stops_requesting() {
    let server = MockServer::start().await;
    mount_pages(&server).await;

    let query = PatientListQuery::all(PatientListOrder::ByFamilyNameAsc).with_page_size(2);
    let mut search = PatientSearch::new(common::unsigned_gateway(&server), query);

    let mut fetched = 0;
    while !search.is_done() {
        let page = search.next_page().await.expect("page");
        assert_eq!(page.total, Some(5));
        fetched += page.patients.len();
    }
    assert_eq!(fetched, 5);

    let empty = search.next_page().await.expect("finished cursor");
    assert!(empty.patients.is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}
