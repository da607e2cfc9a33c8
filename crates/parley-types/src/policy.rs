use crate::models::Role;

/// Membership mutations subject to the role policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomOperation {
    Join,
    Leave,
    Promote,
    Demote,
}

/// Decides whether an actor holding `actor` may apply `op` to a target
/// currently holding `target`. `None` means "not a participant".
pub trait RolePolicy: Send + Sync {
    fn can_mutate(&self, actor: Option<Role>, target: Option<Role>, op: RoomOperation) -> bool;
}

fn rank(role: Option<Role>) -> u8 {
    role.map_or(0, Role::rank)
}

/// SUPER_ADMIN > ADMIN > MEMBER.
///
/// Adding, removing or demoting someone else needs ADMIN or better and a
/// strictly higher rank than the target. Promoting to ADMIN needs a rank
/// above ADMIN, so only a SUPER_ADMIN can hand it out.
#[derive(Debug, Default, Clone, Copy)]
pub struct HierarchyPolicy;

impl RolePolicy for HierarchyPolicy {
    fn can_mutate(&self, actor: Option<Role>, target: Option<Role>, op: RoomOperation) -> bool {
        let actor_rank = rank(actor);
        let outranks = actor_rank > rank(target);

        match op {
            RoomOperation::Join | RoomOperation::Leave | RoomOperation::Demote => {
                actor_rank >= Role::Admin.rank() && outranks
            }
            RoomOperation::Promote => actor_rank > Role::Admin.rank() && outranks,
        }
    }
}

/// Allows every mutation.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenPolicy;

impl RolePolicy for OpenPolicy {
    fn can_mutate(&self, _actor: Option<Role>, _target: Option<Role>, _op: RoomOperation) -> bool {
        true
    }
}
