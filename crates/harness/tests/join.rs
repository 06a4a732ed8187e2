use contactsave_core::{Account, DataRow, FieldDeltaModel, PhoneType, RawContactDelta, RawContactId};
use contactsave_engine::EngineError;
use contactsave_harness::TestDevice;
use contactsave_storage::schema::exceptions;
use contactsave_storage::{ContactStore, ExceptionType, Selection, Target};

fn phone_only(device: &mut TestDevice, number: &str) -> Result<RawContactId, Box<dyn std::error::Error>> {
    let model = FieldDeltaModel::single(
        RawContactDelta::insert(Account::local()).with_data(DataRow::phone(number, PhoneType::Mobile)),
    );
    Ok(device.save(model)?.inserted_raw_contact_id.ok_or("no insert")?)
}

fn keep_together_rows(device: &TestDevice) -> Result<u64, Box<dyn std::error::Error>> {
    Ok(device.store().count(
        Target::AggregationExceptions,
        &Selection::new().eq(exceptions::TYPE, ExceptionType::KeepTogether.code()),
    )?)
}

// ============================================================================
// Joining
// ============================================================================

#[test]
fn three_way_join_pairs_every_raw_contact() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let r1 = device.insert_local("Alice", &[])?;
    let r2 = phone_only(&mut device, "5551234")?;
    let r3 = device.insert_local("Bob", &[])?;

    let c1 = device.contact_of(r1)?.id;
    let c2 = device.contact_of(r2)?.id;
    let merged = device.saver.join(c1, c2, true)?;
    assert_eq!(keep_together_rows(&device)?, 2);

    let c3 = device.contact_of(r3)?.id;
    let merged = device.saver.join(merged.contact_id, c3, true)?;
    assert_eq!(keep_together_rows(&device)?, 6);

    for raw in [r1, r2, r3] {
        assert_eq!(device.contact_of(raw)?.id, merged.contact_id);
    }
    let contact = device.store().contact(merged.contact_id)?.ok_or("joined contact missing")?;
    assert_eq!(contact.display_name.as_deref(), Some("Alice"));
    assert_eq!(contact.name_raw_contact_id, Some(r1));
    assert!(device.store().raw_contact_info(r1)?.ok_or("missing")?.name_verified);
    Ok(())
}

#[test]
fn read_only_join_leaves_name_unverified() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let r1 = device.insert_local("Alice", &[])?;
    let r2 = device.insert_local("Bob", &[])?;

    let c1 = device.contact_of(r1)?.id;
    let c2 = device.contact_of(r2)?.id;
    let merged = device.saver.join(c1, c2, false)?;

    assert_eq!(keep_together_rows(&device)?, 2);
    assert_eq!(device.contact_of(r2)?.id, merged.contact_id);
    for raw in [r1, r2] {
        assert!(!device.store().raw_contact_info(raw)?.ok_or("missing")?.name_verified);
    }
    Ok(())
}

#[test]
fn joining_unknown_contacts_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let mut device = TestDevice::new()?;
    let err = device
        .saver
        .join(contactsave_core::ContactId::new(41), contactsave_core::ContactId::new(42), true)
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert_eq!(device.store().attempts(), 0);
    Ok(())
}
