//! Integration tests for reference erasure and restoration

use std::sync::Arc;

use elif_integrity::{
    Entity, EntityId, EntityRef, GatewayCall, InMemoryGateway, IntegrityError, JoinTable, MetaModel,
    ReferenceEraser, RelationProperty, TypeDescriptor,
};

fn model() -> Arc<MetaModel> {
    Arc::new(
        MetaModel::builder()
            .entity(TypeDescriptor::new("Project", "projects"))
            .entity(TypeDescriptor::new("Member", "members"))
            .entity(TypeDescriptor::new("Secret", "secrets"))
            .relation(
                "Project",
                RelationProperty::one_to_many("members", "Member", "project"),
            )
            .relation(
                "Project",
                RelationProperty::many_to_one("owner", "Member", "owner_id"),
            )
            .relation(
                "Project",
                RelationProperty::many_to_many(
                    "admins",
                    "Member",
                    JoinTable::new("project_admins", "project_id", "member_id"),
                ),
            )
            .relation(
                "Member",
                RelationProperty::many_to_one("project", "Project", "project_id").with_inverse("members"),
            )
            .relation(
                "Member",
                RelationProperty::many_to_one("secret", "Secret", "secret_id"),
            )
            .build()
            .unwrap(),
    )
}

fn eraser() -> (ReferenceEraser, InMemoryGateway) {
    let model = model();
    let gateway = InMemoryGateway::new(model.clone());
    (ReferenceEraser::new(model, Arc::new(gateway.clone())), gateway)
}

fn ids(entity: &EntityRef, property: &str) -> Vec<EntityId> {
    entity
        .references(property)
        .iter()
        .filter_map(EntityRef::id)
        .collect()
}

fn hidden(id: i64) -> impl Fn(&EntityRef) -> bool {
    move |entity: &EntityRef| entity.id() != Some(EntityId::Int(id))
}

#[tokio::test]
async fn test_erase_then_restore_round_trip() {
    let (eraser, gateway) = eraser();
    let members: Vec<EntityRef> = [1, 2, 3]
        .into_iter()
        .map(|id| Entity::new("Member", id).into_ref())
        .collect();
    let project = Entity::new("Project", 10).with_many("members", members.clone()).into_ref();
    gateway.insert_all(&members);

    let set = eraser.collect(&[project.clone()], hidden(2)).unwrap();
    assert_eq!(set.len(), 1);

    assert_eq!(eraser.erase(&set), 1);
    assert_eq!(ids(&project, "members"), vec![EntityId::Int(1), EntityId::Int(3)]);
    assert_eq!(
        project.read().security().erased_ids("members"),
        &[EntityId::Int(2)]
    );

    assert_eq!(eraser.restore(&project).await.unwrap(), 1);
    assert_eq!(
        ids(&project, "members"),
        vec![EntityId::Int(1), EntityId::Int(3), EntityId::Int(2)]
    );
    assert!(project.references("members")[2].ptr_eq(&members[1]));
    assert!(project.read().security().is_empty());
    assert_eq!(
        gateway.calls(),
        vec![GatewayCall::Reference {
            type_name: "Member".to_string(),
            id: EntityId::Int(2),
        }]
    );
}

#[test]
fn test_collect_is_idempotent() {
    let (eraser, _gateway) = eraser();
    let secret = Entity::new("Secret", 7).into_ref();
    let member = Entity::new("Member", 1).with_one("secret", Some(secret)).into_ref();
    let project = Entity::new("Project", 10).with_many("members", vec![member]).into_ref();
    let can_read = |entity: &EntityRef| entity.type_name() != "Secret";

    let first = eraser.collect(&[project.clone()], can_read).unwrap();
    let second = eraser.collect(&[project.clone()], can_read).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
}

#[test]
fn test_cycle_is_walked_once() {
    let (eraser, _gateway) = eraser();
    let project = Entity::new("Project", 10).into_ref();
    let member = Entity::new("Member", 1)
        .with_one("project", Some(project.clone()))
        .with_one("secret", Some(Entity::new("Secret", 7).into_ref()))
        .into_ref();
    project.write().set_many("members", vec![member.clone()]);
    project.write().set_one("owner", Some(member.clone()));

    let set = eraser
        .collect(&[project.clone(), member.clone()], |entity| entity.type_name() != "Secret")
        .unwrap();

    assert_eq!(set.len(), 1);
    let only = set.iter().next().unwrap();
    assert!(only.owner.ptr_eq(&member));
    assert_eq!(only.property, "secret");
}

#[test]
fn test_unreadable_entity_is_not_traversed() {
    let (eraser, _gateway) = eraser();
    let deeper = Entity::new("Secret", 8).into_ref();
    let hidden_member = Entity::new("Member", 2).with_one("secret", Some(deeper)).into_ref();
    let project = Entity::new("Project", 10)
        .with_many("members", vec![hidden_member])
        .into_ref();

    let set = eraser
        .collect(&[project.clone()], |entity| entity.type_name() == "Project")
        .unwrap();

    assert_eq!(set.len(), 1);
    assert_eq!(set.for_owner(&project).count(), 1);
}

#[test]
fn test_unloaded_relations_are_never_followed() {
    let (eraser, gateway) = eraser();
    let project = Entity::new("Project", 10).into_ref();

    let set = eraser.collect(&[project], |_| false).unwrap();

    assert!(set.is_empty());
    assert!(gateway.calls().is_empty());
}

#[test]
fn test_single_valued_reference_is_erased_when_id_matches() {
    let (eraser, _gateway) = eraser();
    let owner = Entity::new("Member", 1).into_ref();
    let project = Entity::new("Project", 10).with_one("owner", Some(owner)).into_ref();

    let set = eraser.collect(&[project.clone()], hidden(1)).unwrap();
    let replacement = Entity::new("Member", 5).into_ref();
    project.write().set_one("owner", Some(replacement));

    assert_eq!(eraser.erase(&set), 0);
    assert_eq!(ids(&project, "owner"), vec![EntityId::Int(5)]);

    project.write().set_one("owner", Some(Entity::new("Member", 1).into_ref()));
    assert_eq!(eraser.erase(&set), 1);
    assert!(project.references("owner").is_empty());
}

#[tokio::test]
async fn test_single_valued_reference_is_restored() {
    let (eraser, _gateway) = eraser();
    let owner = Entity::new("Member", 1).into_ref();
    let project = Entity::new("Project", 10).with_one("owner", Some(owner)).into_ref();

    let set = eraser.collect(&[project.clone()], hidden(1)).unwrap();
    eraser.erase(&set);
    assert!(project.references("owner").is_empty());

    assert_eq!(eraser.restore(&project).await.unwrap(), 1);
    assert_eq!(ids(&project, "owner"), vec![EntityId::Int(1)]);
}

#[tokio::test]
async fn test_restore_fails_on_unloaded_collection() {
    let (eraser, _gateway) = eraser();
    let project = Entity::new("Project", 10)
        .with_many("members", vec![Entity::new("Member", 2).into_ref()])
        .into_ref();
    let set = eraser.collect(&[project.clone()], hidden(2)).unwrap();
    eraser.erase(&set);
    project.write().unload("members");

    let err = eraser.restore(&project).await.unwrap_err();

    match err {
        IntegrityError::RestoreFailure { type_name, property } => {
            assert_eq!(type_name, "Project");
            assert_eq!(property, "members");
        }
        other => panic!("expected a restore failure, got {:?}", other),
    }
    assert!(!project.read().security().is_empty());
}

#[tokio::test]
async fn test_failed_restore_leaves_every_property_untouched() {
    let (eraser, gateway) = eraser();
    let admin = Entity::new("Member", 1).into_ref();
    let member = Entity::new("Member", 2).into_ref();
    let project = Entity::new("Project", 10)
        .with_many("admins", vec![admin.clone()])
        .with_many("members", vec![member.clone()])
        .into_ref();
    gateway.insert_all([&admin, &member]);

    let set = eraser
        .collect(&[project.clone()], |entity| entity.type_name() == "Project")
        .unwrap();
    assert_eq!(eraser.erase(&set), 2);
    project.write().unload("members");

    let err = eraser.restore(&project).await.unwrap_err();

    assert!(matches!(
        err,
        IntegrityError::RestoreFailure { ref property, .. } if property == "members"
    ));
    assert!(project.references("admins").is_empty());
    assert_eq!(project.read().security().erased_ids("admins"), &[EntityId::Int(1)]);
    assert_eq!(project.read().security().erased_ids("members"), &[EntityId::Int(2)]);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn test_new_entities_are_not_restored() {
    let (eraser, gateway) = eraser();
    let mut draft = Entity::transient("Project");
    draft.security_mut().record("members", EntityId::Int(2));
    let draft = draft.with_many("members", Vec::new()).into_ref();

    assert_eq!(eraser.restore(&draft).await.unwrap(), 0);
    assert!(draft.references("members").is_empty());
    assert!(gateway.calls().is_empty());
}

#[test]
fn test_unreadable_reference_without_id_is_rejected() {
    let (eraser, _gateway) = eraser();
    let project = Entity::new("Project", 10)
        .with_many("members", vec![Entity::transient("Member").into_ref()])
        .into_ref();

    let err = eraser.collect(&[project], |entity| entity.id().is_some()).unwrap_err();

    assert!(matches!(err, IntegrityError::IllegalState(_)));
}
