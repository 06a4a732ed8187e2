use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use contactsave_core::{Account, DataRow, FieldDeltaModel, RawContactDelta};
use contactsave_engine::{EngineError, Request, Response, SaveRequest, SaveService};
use contactsave_harness::TestDevice;

const WAIT: Duration = Duration::from_secs(5);

type Seen = Rc<RefCell<Vec<Result<Response, EngineError>>>>;

fn recorder(seen: &Seen) -> impl FnOnce(Result<Response, EngineError>) + 'static {
    let seen = Rc::clone(seen);
    move |outcome| seen.borrow_mut().push(outcome)
}

fn new_contact(name: &str) -> Request {
    Request::Save(SaveRequest::new(FieldDeltaModel::single(
        RawContactDelta::insert(Account::local()).with_data(DataRow::name(name)),
    )))
}

// ============================================================================
// Request flow
// ============================================================================

#[test]
fn requests_complete_in_submission_order() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let mut service = SaveService::spawn(device.saver)?;
    let seen: Seen = Rc::default();

    service.submit(new_contact("Ann"), recorder(&seen))?;
    let group = service.submit(
        Request::CreateGroup {
            account: Account::local(),
            label: "Friends".into(),
            members: Vec::new(),
        },
        recorder(&seen),
    )?;
    assert!(service.wait_for(group, WAIT)?);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    match &seen[0] {
        Ok(Response::Saved(result)) => {
            assert!(result.succeeded);
            assert!(result.contact.is_some());
        }
        other => panic!("unexpected save outcome: {other:?}"),
    }
    assert!(matches!(seen[1], Ok(Response::GroupCreated(_))));
    Ok(())
}

#[test]
fn failures_reach_the_callback() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let mut service = SaveService::spawn(device.saver)?;
    let seen: Seen = Rc::default();

    let id = service.submit(
        Request::DeleteContact(contactsave_core::ContactId::new(99)),
        recorder(&seen),
    )?;
    assert!(service.wait_for(id, WAIT)?);
    assert!(matches!(seen.borrow()[0], Err(EngineError::NotFound(_))));

    // The worker keeps serving after a failed request.
    let id = service.submit(new_contact("Bob"), recorder(&seen))?;
    assert!(service.wait_for(id, WAIT)?);
    assert!(matches!(seen.borrow()[1], Ok(Response::Saved(_))));
    Ok(())
}

// ============================================================================
// Listener lifecycle
// ============================================================================

#[test]
fn detached_callbacks_never_run() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let mut service = SaveService::spawn(device.saver)?;
    let seen: Seen = Rc::default();

    let first = service.submit(new_contact("Ann"), recorder(&seen))?;
    assert!(service.detach(first));
    assert!(!service.detach(first));
    assert_eq!(service.pending_callbacks(), 0);

    let second = service.submit(new_contact("Bob"), recorder(&seen))?;
    assert!(service.wait_for(second, WAIT)?);
    assert_eq!(seen.borrow().len(), 1);
    Ok(())
}

#[test]
fn shutdown_drains_queued_requests() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new()?;
    let card = device.card.clone();
    let mut service = SaveService::spawn(device.saver)?;
    let seen: Seen = Rc::default();

    for name in ["Ann", "Bob", "Cat"] {
        service.submit(new_contact(name), recorder(&seen))?;
    }
    service.submit_detached(Request::ImportCard(contactsave_core::CardId::Sim1))?;
    assert_eq!(service.shutdown(), 3);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|outcome| matches!(outcome, Ok(Response::Saved(_)))));
    assert_eq!(card.used(), 0);
    Ok(())
}
