use contactsave_core::{
    Account, DataKind, DataRow, EmailType, FieldDeltaModel, PhoneType, RawContactDelta, columns,
};
use contactsave_engine::{ContactSaver, EngineError, SaveConfig, SaveRequest};
use contactsave_harness::{Fault, TestDevice};
use contactsave_storage::schema::data as data_cols;
use contactsave_storage::{ContactStore, ProviderOp, SqliteProvider, Target};

// ============================================================================
// Insert and update
// ============================================================================

#[test]
fn insert_local_contact_resolves_contact_ref() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let model = FieldDeltaModel::single(
        RawContactDelta::insert(Account::local())
            .with_data(DataRow::name("Jane Doe"))
            .with_data(DataRow::phone("555-1234", PhoneType::Mobile))
            .with_data(DataRow::email("jane@example.org", EmailType::Home)),
    );
    let result = device.save(model)?;
    assert!(result.succeeded);

    let raw = result.inserted_raw_contact_id.ok_or("no raw contact inserted")?;
    let contact = device.contact_of(raw)?;
    assert_eq!(result.contact, Some(contact.contact_ref()));
    assert_eq!(contact.display_name.as_deref(), Some("Jane Doe"));

    // The edit bracket restored normal aggregation.
    let info = device.store().raw_contact_info(raw)?.ok_or("missing")?;
    assert_eq!(info.aggregation_mode, contactsave_core::AggregationMode::Default);
    assert_eq!(device.snapshot(raw)?.data.len(), 3);
    Ok(())
}

#[test]
fn update_touches_only_changed_rows() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let raw = device.insert_local("Jane", &[("5551234", PhoneType::Mobile)])?;
    let version = device.snapshot(raw)?.state.version;

    let mut delta = device.edit(raw)?;
    for entry in delta.entries_mut(&DataKind::Phone) {
        entry.set(columns::NUMBER, "5559999");
    }
    device.store_mut().reset_counters();
    let result = device.save(FieldDeltaModel::single(delta))?;
    assert!(result.succeeded);
    assert_eq!(result.inserted_raw_contact_id, None);
    assert_eq!(device.store().committed(), 1);

    let snapshot = device.snapshot(raw)?;
    assert!(snapshot.state.version > version);
    let phone = snapshot.rows(&DataKind::Phone).next().ok_or("no phone")?;
    assert_eq!(phone.text(columns::NUMBER), Some("5559999"));
    let name = snapshot.rows(&DataKind::StructuredName).next().ok_or("no name")?;
    assert_eq!(name.text(columns::DISPLAY_NAME), Some("Jane"));
    Ok(())
}

#[test]
fn unchanged_model_issues_no_batch() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let raw = device.insert_local("Jane", &[])?;
    device.store_mut().reset_counters();

    let result = device.save(FieldDeltaModel::single(device.edit(raw)?))?;
    assert!(result.succeeded);
    assert_eq!(device.store().attempts(), 0);
    Ok(())
}

// ============================================================================
// Trimming and normalization
// ============================================================================

#[test]
fn emptied_row_is_deleted_and_empty_insert_dropped() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let raw = device.insert_local("Jane", &[("5551234", PhoneType::Mobile)])?;

    let mut delta = device.edit(raw)?;
    for entry in delta.entries_mut(&DataKind::Phone) {
        entry.set(columns::NUMBER, "   ");
    }
    delta.add(contactsave_core::DataDelta::insert(DataRow::email("", EmailType::Work)));
    device.save(FieldDeltaModel::single(delta))?;

    let snapshot = device.snapshot(raw)?;
    assert_eq!(snapshot.rows(&DataKind::Phone).count(), 0);
    assert_eq!(snapshot.rows(&DataKind::Email).count(), 0);
    assert_eq!(snapshot.rows(&DataKind::StructuredName).count(), 1);
    Ok(())
}

#[test]
fn only_first_super_primary_survives() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let model = FieldDeltaModel::single(
        RawContactDelta::insert(Account::local())
            .with_data(DataRow::phone("111", PhoneType::Mobile).super_primary())
            .with_data(DataRow::phone("222", PhoneType::Home).super_primary()),
    );
    let raw = device.save(model)?.inserted_raw_contact_id.ok_or("no insert")?;

    let supers: Vec<_> = device
        .snapshot(raw)?
        .data
        .into_iter()
        .filter(|row| row.is_super_primary)
        .collect();
    assert_eq!(supers.len(), 1);
    assert_eq!(supers[0].text(columns::NUMBER), Some("111"));
    Ok(())
}

// ============================================================================
// Conflicts and retry
// ============================================================================

#[test]
fn conflict_on_first_attempt_is_reparented() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let raw = device.insert_local("Jane", &[("5551234", PhoneType::Mobile)])?;
    let model = {
        let mut delta = device.edit(raw)?;
        delta.add(contactsave_core::DataDelta::insert(DataRow::email("old@example.org", EmailType::Home)));
        delta
    };
    device.save(FieldDeltaModel::single(model))?;

    // Open the edit, then let another writer rename the contact.
    let mut delta = device.edit(raw)?;
    for entry in delta.entries_mut(&DataKind::Email) {
        entry.set(columns::ADDRESS, "new@example.org");
    }
    let name_row = device
        .snapshot(raw)?
        .rows(&DataKind::StructuredName)
        .next()
        .and_then(|row| row.id)
        .ok_or("no name row")?;
    device.store_mut().inject(Fault::ConcurrentWrite(vec![ProviderOp::update(Target::Data)
        .with_selection(data_cols::ID, name_row.get())
        .value(columns::DISPLAY_NAME, "Janet")
        .build()]));
    device.store_mut().reset_counters();

    let result = device.save(FieldDeltaModel::single(delta))?;
    assert!(result.succeeded);
    assert_eq!(device.store().attempts(), 2);
    assert_eq!(device.store().committed(), 1);

    let snapshot = device.snapshot(raw)?;
    let email = snapshot.rows(&DataKind::Email).next().ok_or("no email")?;
    assert_eq!(email.text(columns::ADDRESS), Some("new@example.org"));
    let name = snapshot.rows(&DataKind::StructuredName).next().ok_or("no name")?;
    assert_eq!(name.text(columns::DISPLAY_NAME), Some("Janet"));
    let phone = snapshot.rows(&DataKind::Phone).next().ok_or("no phone")?;
    assert_eq!(phone.text(columns::NUMBER), Some("5551234"));
    Ok(())
}

#[test]
fn persistent_conflict_exhausts_retries() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let raw = device.insert_local("Jane", &[])?;
    let mut delta = device.edit(raw)?;
    for entry in delta.entries_mut(&DataKind::StructuredName) {
        entry.set(columns::DISPLAY_NAME, "Janet");
    }
    for _ in 0..3 {
        device.store_mut().inject(Fault::Conflict);
    }
    device.store_mut().reset_counters();

    let err = device.saver.save(SaveRequest::new(FieldDeltaModel::single(delta))).unwrap_err();
    assert!(matches!(err, EngineError::RetriesExhausted { attempts: 3 }));
    assert_eq!(device.store().attempts(), 3);
    assert_eq!(device.store().committed(), 0);
    Ok(())
}

#[test]
fn configured_tries_bound_attempts() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::with_config(SaveConfig {
        persist_tries: 1,
        ..SaveConfig::default()
    })?;
    let raw = device.insert_local("Jane", &[])?;
    let mut delta = device.edit(raw)?;
    for entry in delta.entries_mut(&DataKind::StructuredName) {
        entry.set(columns::DISPLAY_NAME, "Janet");
    }
    device.store_mut().inject(Fault::Conflict);

    let err = device.saver.save(SaveRequest::new(FieldDeltaModel::single(delta))).unwrap_err();
    assert!(matches!(err, EngineError::RetriesExhausted { attempts: 1 }));
    Ok(())
}

#[test]
fn conflict_on_new_contact_is_inconsistent_state() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    device.store_mut().inject(Fault::Conflict);
    let model = FieldDeltaModel::single(RawContactDelta::insert(Account::local()).with_data(DataRow::name("Jane")));

    let err = device.saver.save(SaveRequest::new(model)).unwrap_err();
    assert!(matches!(err, EngineError::InconsistentState(_)));
    Ok(())
}

#[test]
fn transport_failure_is_not_retried() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    device.store_mut().inject(Fault::Unavailable);
    let model = FieldDeltaModel::single(RawContactDelta::insert(Account::local()).with_data(DataRow::name("Jane")));

    let err = device.saver.save(SaveRequest::new(model)).unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)));
    assert_eq!(device.store().attempts(), 1);
    assert!(device.store().raw_contacts_for_account(&Account::local())?.is_empty());
    Ok(())
}

// ============================================================================
// Photos, profile, memberships
// ============================================================================

#[test]
fn photo_for_inserted_contact_uses_new_id() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let request = SaveRequest::new(FieldDeltaModel::single(
        RawContactDelta::insert(Account::local()).with_data(DataRow::name("Jane")),
    ))
    .with_photo(-1, "file:///photos/jane.jpg");
    let result = device.saver.save(request)?;
    assert!(result.succeeded);

    let raw = result.inserted_raw_contact_id.ok_or("no insert")?;
    let log = device.photos.lock().map_err(|_| "poisoned")?;
    assert_eq!(log.as_slice(), &[(raw, "file:///photos/jane.jpg".to_string())]);
    Ok(())
}

#[test]
fn failed_photo_reports_unsuccessful_save() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let request = SaveRequest::new(FieldDeltaModel::single(
        RawContactDelta::insert(Account::local()).with_data(DataRow::name("Jane")),
    ))
    .with_photo(-1, "bad:blob");
    let result = device.saver.save(request)?;
    assert!(!result.succeeded);
    assert!(result.contact.is_some());
    Ok(())
}

#[test]
fn profile_save_resolves_profile_contact() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    device.insert_local("Someone else", &[])?;

    let mut delta = RawContactDelta::insert(Account::local()).with_data(DataRow::name("Me"));
    if let Some(state) = delta.after_mut() {
        state.is_profile = true;
    }
    let result = device.saver.save(SaveRequest::new(FieldDeltaModel::single(delta)).profile())?;
    let raw = result.inserted_raw_contact_id.ok_or("no insert")?;
    assert_eq!(result.contact, device.store().profile_contact()?);
    assert_eq!(result.contact, Some(device.contact_of(raw)?.contact_ref()));
    Ok(())
}

#[test]
fn group_memberships_follow_the_save() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let friends = device.create_group(&Account::local(), "Friends")?;
    let family = device.create_group(&Account::local(), "Family")?;

    let model = FieldDeltaModel::single(
        RawContactDelta::insert(Account::local())
            .with_data(DataRow::name("Jane"))
            .with_data(DataRow::group_membership(friends)),
    );
    let raw = device.save(model)?.inserted_raw_contact_id.ok_or("no insert")?;
    assert_eq!(device.store().group_ids_for_raw_contact(raw)?, vec![friends]);

    let mut delta = device.edit(raw)?;
    for entry in delta.entries_mut(&DataKind::GroupMembership) {
        entry.mark_deleted();
    }
    delta.add(contactsave_core::DataDelta::insert(DataRow::group_membership(family)));
    device.save(FieldDeltaModel::single(delta))?;
    assert_eq!(device.store().group_ids_for_raw_contact(raw)?, vec![family]);
    Ok(())
}

// ============================================================================
// On-disk provider
// ============================================================================

#[test]
fn saved_contact_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("contacts.db");
    let path = path.to_str().ok_or("non-utf8 path")?;

    let raw = {
        let mut saver = ContactSaver::new(SqliteProvider::open(path)?, SaveConfig::default());
        let model = FieldDeltaModel::single(
            RawContactDelta::insert(Account::local()).with_data(DataRow::name("Jane")),
        );
        saver.save(SaveRequest::new(model))?.inserted_raw_contact_id.ok_or("no insert")?
    };

    let store = SqliteProvider::open(path)?;
    let snapshot = store.raw_contact(raw)?.ok_or("missing after reopen")?;
    assert_eq!(snapshot.data[0].text(columns::DISPLAY_NAME), Some("Jane"));
    Ok(())
}

// ============================================================================
// Flag requests
// ============================================================================

#[test]
fn contact_flags_are_single_row_updates() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let raw = device.insert_local("Jane", &[])?;
    let contact = device.contact_of(raw)?.id;
    device.store_mut().reset_counters();

    device.saver.set_starred(contact, true)?;
    device.saver.set_send_to_voicemail(contact, true)?;
    device.saver.set_ringtone(contact, Some("chime.ogg"))?;
    assert_eq!(device.store().committed(), 3);

    let record = device.contact_of(raw)?;
    assert!(record.starred);
    assert!(record.send_to_voicemail);
    assert_eq!(record.custom_ringtone.as_deref(), Some("chime.ogg"));

    device.saver.set_ringtone(contact, None)?;
    assert_eq!(device.contact_of(raw)?.custom_ringtone, None);
    Ok(())
}

#[test]
fn super_primary_can_be_set_and_cleared() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let raw = device.insert_local("Jane", &[("5551234", PhoneType::Mobile), ("5559999", PhoneType::Work)])?;
    let work = device
        .snapshot(raw)?
        .rows(&DataKind::Phone)
        .find(|row| row.phone_type() == Some(PhoneType::Work))
        .and_then(|row| row.id)
        .ok_or("no work number")?;

    device.saver.set_super_primary(work)?;
    let row = device
        .snapshot(raw)?
        .rows(&DataKind::Phone)
        .find(|row| row.id == Some(work))
        .cloned()
        .ok_or("work number vanished")?;
    assert!(row.is_primary && row.is_super_primary);

    device.saver.clear_primary(work)?;
    let row = device
        .snapshot(raw)?
        .rows(&DataKind::Phone)
        .find(|row| row.id == Some(work))
        .cloned()
        .ok_or("work number vanished")?;
    assert!(!row.is_primary && !row.is_super_primary);
    Ok(())
}
