//! Group CRUD + membership. `everyone` is undeletable.

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{delete, get, post, State};
use serde::{Deserialize, Serialize};

use crate::bus::NotificationBus;
use crate::dispatch::EVERYONE_GROUP;
use crate::error::Error;
use crate::ids;
use crate::models::{Group, GroupMember, MemberType};
use crate::store::Store;
use crate::writer::{EventWriter, RawEvent};

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_by: String,
}

#[post("/rpc/group/create", data = "<body>")]
pub fn create(
    body: Json<CreateGroupRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<Group>, Error> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(Error::InvalidArgument("name is required".to_string()));
    }
    if store.get_group_by_name(name)?.is_some() {
        return Err(Error::Conflict(format!("group already exists: {name}")));
    }

    let group = Group {
        group_id: ids::new_group_id(),
        name: name.to_string(),
        description: body.description.clone(),
        created_at: ids::now_rfc3339(),
        created_by: body.created_by.clone(),
        members: Vec::new(),
    };

    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "group.create".to_string(),
            origin_daemon: None,
            timestamp: Some(group.created_at.clone()),
            v: None,
            body: serde_json::to_value(&group).map_err(|e| Error::Internal(e.to_string()))?,
            author_agent_id: None,
        },
        |_event| store.insert_group(&group),
    )?;

    Ok(Json(group))
}

#[derive(Debug, Serialize)]
pub struct DeleteGroupResponse {
    pub name: String,
}

/// `everyone` cannot be deleted.
#[delete("/rpc/group/delete?<name>")]
pub fn delete_group(
    name: &str,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<DeleteGroupResponse>, Error> {
    if name == EVERYONE_GROUP {
        return Err(Error::InvalidArgument("the everyone group cannot be deleted".to_string()));
    }
    if store.get_group_by_name(name)?.is_none() {
        return Err(Error::NotFound(format!("unknown group: {name}")));
    }
    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "group.delete".to_string(),
            origin_daemon: None,
            timestamp: Some(ids::now_rfc3339()),
            v: None,
            body: serde_json::json!({"name": name}),
            author_agent_id: None,
        },
        |_event| store.delete_group(name).map(|_| ()),
    )?;
    Ok(Json(DeleteGroupResponse { name: name.to_string() }))
}

#[derive(Debug, Serialize)]
pub struct GroupListResponse {
    pub groups: Vec<Group>,
}

#[get("/rpc/group/list")]
pub fn list(store: &State<Arc<Store>>) -> Result<Json<GroupListResponse>, Error> {
    Ok(Json(GroupListResponse {
        groups: store.list_groups()?,
    }))
}

#[get("/rpc/group/info?<name>")]
pub fn info(name: &str, store: &State<Arc<Store>>) -> Result<Json<Group>, Error> {
    store
        .get_group_by_name(name)?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("unknown group: {name}")))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub group_name: String,
    pub member_type: MemberType,
    pub member_value: String,
    pub added_by: String,
}

/// Mutates membership; affects future dispatch only (role/group snapshots
/// are taken at send time, not continuously).
#[post("/rpc/group/member/add", data = "<body>")]
pub fn add_member(
    body: Json<AddMemberRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<Group>, Error> {
    let group = store
        .get_group_by_name(&body.group_name)?
        .ok_or_else(|| Error::InvalidArgument(format!("group not found: {}", body.group_name)))?;

    let member = GroupMember {
        group_id: group.group_id.clone(),
        member_type: body.member_type,
        member_value: body.member_value.clone(),
        added_at: ids::now_rfc3339(),
        added_by: body.added_by.clone(),
    };

    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "group.member.add".to_string(),
            origin_daemon: None,
            timestamp: Some(member.added_at.clone()),
            v: None,
            body: serde_json::to_value(&member).map_err(|e| Error::Internal(e.to_string()))?,
            author_agent_id: None,
        },
        |_event| store.add_group_member(&member),
    )?;

    store
        .get_group_by_name(&body.group_name)?
        .map(Json)
        .ok_or_else(|| Error::Internal("group disappeared after member add".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct RemoveMemberRequest {
    pub group_name: String,
    pub member_value: String,
}

#[post("/rpc/group/member/remove", data = "<body>")]
pub fn remove_member(
    body: Json<RemoveMemberRequest>,
    store: &State<Arc<Store>>,
    writer: &State<Arc<EventWriter>>,
    bus: &State<Arc<NotificationBus>>,
) -> Result<Json<Group>, Error> {
    let group = store
        .get_group_by_name(&body.group_name)?
        .ok_or_else(|| Error::InvalidArgument(format!("group not found: {}", body.group_name)))?;

    writer.write_event(
        store,
        bus,
        RawEvent {
            event_id: None,
            type_: "group.member.remove".to_string(),
            origin_daemon: None,
            timestamp: Some(ids::now_rfc3339()),
            v: None,
            body: serde_json::json!({
                "group_name": body.group_name,
                "member_value": body.member_value,
            }),
            author_agent_id: None,
        },
        |_event| store.remove_group_member(&group.group_id, &body.member_value).map(|_| ()),
    )?;

    store
        .get_group_by_name(&body.group_name)?
        .map(Json)
        .ok_or_else(|| Error::Internal("group disappeared after member remove".to_string()))
}
