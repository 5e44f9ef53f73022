use super::context::{Role, TenantContext};
use super::error::TenantError;

/// Fails when the context's role is strictly lower than `required`
pub fn require_role(ctx: &TenantContext, required: Role) -> Result<(), TenantError> {
    let actual = ctx.user_role();
    if actual < required {
        return Err(TenantError::RoleInsufficient { actual, required });
    }
    Ok(())
}
