//! Account lifecycle: creation, update, deletion, login.
//!
//! Creation is a multi-step transaction across the store, the authenticator
//! and the validators. Any failure after the user row is persisted issues a
//! compensating delete so no provisional account survives.

use crate::auth::{AuthLevel, AuthRecord, Features};
use crate::error::StoreError;
use crate::messages::{
    decode_store_error, err_already_authenticated, err_malformed, err_not_found,
    err_permission_denied, is_null_value, no_err, no_err_created, no_err_evicted, no_err_params,
    ClientAcc, ClientCred, ClientDel,
};
use crate::plugins::AccountAction;
use crate::presence;
use crate::state::access::AccessMode;
use crate::state::session::Session;
use crate::state::switchboard::Switchboard;
use crate::state::uid::{TopicCat, Uid};
use crate::store::types::{time_now, User};
use crate::tags::{missing_methods, normalize_tags, restricted_tags_equal};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Validity of the no-login token handed to validators during account
/// creation.
const VALIDATION_TOKEN_LIFETIME: Duration = Duration::hours(24);

/// Drop credentials with unknown methods; when `require_value` is set also
/// drop entries without a value (creation needs the value, confirmation of a
/// previously requested credential does not).
fn normalize_credentials(
    sb: &Switchboard,
    creds: &[ClientCred],
    require_value: bool,
) -> Vec<ClientCred> {
    creds
        .iter()
        .filter(|cr| !cr.method.is_empty() && sb.validators.get(&cr.method).is_some())
        .filter(|cr| !require_value || !cr.value.is_empty())
        .cloned()
        .collect()
}

fn credential_methods(creds: &[ClientCred]) -> Vec<String> {
    let mut methods: Vec<String> = creds.iter().map(|cr| cr.method.clone()).collect();
    methods.sort();
    methods.dedup();
    methods
}

/// Process a request for a new account.
pub async fn create_user(sb: &Arc<Switchboard>, sess: &Arc<Session>, msg: &ClientAcc) {
    let now = time_now();

    // The session cannot authenticate with the new account when it is
    // already authenticated.
    if msg.login && sess.is_authenticated() {
        warn!(sid = %sess.sid, "create user: login requested while authenticated");
        sess.queue_out(err_already_authenticated(&msg.id, "", now));
        return;
    }

    // Find the authenticator for the requested scheme.
    let Some(authhdl) = sb.auth.get(&msg.scheme) else {
        warn!(sid = %sess.sid, scheme = %msg.scheme, "create user: unknown auth scheme");
        sess.queue_out(err_malformed(&msg.id, "", now));
        return;
    };

    // Check uniqueness of the secret.
    if let Err(e) = authhdl.is_unique(&msg.secret).await {
        warn!(sid = %sess.sid, error = %e, "create user: auth secret is not unique");
        sess.queue_out(decode_store_error(&e, &msg.id, "", now, Some(json!({"what": "auth"}))));
        return;
    }

    let mut user = User::new(Uid::ZERO);

    // Ensure tags are unique and not restricted.
    if let Some(tags) = normalize_tags(&msg.tags) {
        if !restricted_tags_equal(&[], &tags, &sb.config.tags.restricted) {
            warn!(sid = %sess.sid, "create user: attempt to assign restricted tags");
            let mut reply = err_permission_denied(&msg.id, "", now);
            if let crate::messages::ServerMsg::Ctrl(c) = &mut reply {
                c.params = Some(json!({"what": "tags"}));
            }
            sess.queue_out(reply);
            return;
        }
        user.tags = tags;
    }

    // Pre-check credentials for validity. The user's auth level is not known
    // yet, so the required-set size is enforced later.
    let creds = normalize_credentials(sb, &msg.cred, true);
    for cr in &creds {
        let Some(entry) = sb.validators.get(&cr.method) else {
            continue;
        };
        if let Err(e) = entry.validator.pre_check(&cr.value, cr.params.as_ref()).await {
            warn!(sid = %sess.sid, method = %cr.method, error = %e, "create user: credential pre-check failed");
            sess.queue_out(decode_store_error(&e, &msg.id, "", now, Some(json!({"what": cr.method.as_str()}))));
            return;
        }
    }

    // Assign default access in case the creator did not provide it.
    user.access.auth = sb.default_access(TopicCat::P2P, true);
    user.access.anon = sb.default_access(TopicCat::P2P, false);

    // Apply the provided access values, public and private.
    let mut private: Option<Value> = None;
    if let Some(desc) = &msg.desc {
        if let Some(da) = &desc.default_acs {
            if let Some(mode) = parse_default_mode(&da.auth) {
                user.access.auth = clamp_p2p(mode);
            }
            if let Some(mode) = parse_default_mode(&da.anon) {
                user.access.anon = clamp_p2p(mode);
            }
        }
        if let Some(public) = &desc.public {
            if !is_null_value(public) {
                user.public = Some(public.clone());
            }
        }
        if let Some(p) = &desc.private {
            if !is_null_value(p) {
                private = Some(p.clone());
            }
        }
    }

    // Create the user record.
    user.id = sb.uid_gen.next();
    if let Err(e) = sb.store.create_user(&user, private.as_ref()).await {
        warn!(sid = %sess.sid, error = %e, "create user: failed to create user");
        sess.queue_out(decode_store_error(&e, &msg.id, "", now, None));
        return;
    }

    // Add the authentication record. It may rewrite the tags.
    let mut rec = AuthRecord::new(user.id);
    rec.tags = user.tags.clone();
    let rec = match authhdl.add_record(&rec, &msg.secret).await {
        Ok(rec) => rec,
        Err(e) => {
            warn!(sid = %sess.sid, error = %e, "create user: add auth record failed");
            compensate_delete(sb, user.id).await;
            sess.queue_out(decode_store_error(&e, &msg.id, "", now, None));
            return;
        }
    };
    user.tags = rec.tags.clone();

    // The account must come with all credentials its auth level requires.
    let required = sb.validators.required_for(rec.auth_level);
    if creds.len() < required.len() {
        warn!(
            sid = %sess.sid,
            have = ?credential_methods(&creds),
            want = ?required,
            "create user: missing credentials"
        );
        compensate_delete(sb, user.id).await;
        let missing = missing_methods(required, &credential_methods(&creds));
        sess.queue_out(decode_store_error(
            &StoreError::Policy,
            &msg.id,
            "",
            now,
            Some(json!({"creds": missing})),
        ));
        return;
    }

    // Short-lived token the validators may embed into confirmation links.
    let tmp_token = validation_token(sb, user.id);

    // Save credentials, collecting the ones validated in this call.
    let validated = match add_creds(sb, user.id, &creds, rec.tags.clone(), &sess.lang, &tmp_token).await {
        Ok(validated) => validated,
        Err(e) => {
            warn!(sid = %sess.sid, error = %e, "create user: failed to save or validate credential");
            compensate_delete(sb, user.id).await;
            sess.queue_out(decode_store_error(&e, &msg.id, "", now, None));
            return;
        }
    };

    let mut params = json!({
        "user": user.id.user_id(),
        "authlvl": rec.auth_level.as_str(),
        "desc": {
            "created": user.created_at,
            "updated": user.updated_at,
            "defaultAcs": {
                "auth": user.access.auth.to_string(),
                "anon": user.access.anon.to_string(),
            },
            "public": user.public.clone(),
            "private": private,
        },
    });

    if msg.login {
        // Hand off to the login flow: the session adopts the new identity
        // and receives a login token alongside the created descriptor.
        sess.set_identity(user.id, rec.auth_level);
        if let Some((token, expires)) = login_token(sb, user.id, rec.auth_level) {
            params["token"] = json!(token);
            params["expires"] = json!(expires);
        }
        let missing = missing_methods(required, &validated);
        if !missing.is_empty() {
            params["cred"] = json!(missing);
        }
    }

    info!(sid = %sess.sid, user = %user.id.user_id(), "account created");
    sess.queue_out(no_err_created(&msg.id, "", now, params));

    sb.plugin_account(&user, AccountAction::Create);
}

/// Process an account update: either an authentication change or a
/// credential change, never both.
pub async fn update_user(sb: &Arc<Switchboard>, sess: &Arc<Session>, msg: &ClientAcc) {
    let now = time_now();

    if !sess.is_authenticated() {
        warn!(sid = %sess.sid, "update user: session not authenticated");
        sess.queue_out(err_permission_denied(&msg.id, "", now));
        return;
    }

    let mut uid = sess.uid();
    let mut auth_lvl = sess.auth_lvl();

    if !msg.user.is_empty() && msg.user != uid.user_id() {
        // Editing another user's account requires root.
        if sess.auth_lvl() != AuthLevel::Root {
            warn!(sid = %sess.sid, "update user: attempt to change another's account by non-root");
            sess.queue_out(err_permission_denied(&msg.id, "", now));
            return;
        }
        let (parsed_uid, parsed_lvl) = (
            Uid::parse_user_id(&msg.user),
            AuthLevel::parse(&msg.auth_level),
        );
        match (parsed_uid, parsed_lvl) {
            (Some(u), Some(lvl)) if !u.is_zero() && lvl != AuthLevel::None => {
                uid = u;
                auth_lvl = lvl;
            }
            _ => {
                warn!(sid = %sess.sid, "update user: user id or auth level missing");
                sess.queue_out(err_malformed(&msg.id, "", now));
                return;
            }
        }
    }

    let user = match sb.store.get_user(uid).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            sess.queue_out(err_not_found(&msg.id, "", now));
            return;
        }
        Err(e) => {
            warn!(sid = %sess.sid, error = %e, "update user: failed to fetch user");
            sess.queue_out(decode_store_error(&e, &msg.id, "", now, None));
            return;
        }
    };

    let mut params: Option<Value> = None;
    let result = if !msg.scheme.is_empty() {
        update_user_auth(sb, &user, &msg.scheme, &msg.secret).await
    } else if !msg.cred.is_empty() {
        match update_creds(sb, uid, auth_lvl, &msg.cred).await {
            Ok(validated) => {
                let missing =
                    missing_methods(sb.validators.required_for(auth_lvl), &validated);
                if !missing.is_empty() {
                    params = Some(json!({"cred": missing}));
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    } else {
        Err(StoreError::Malformed)
    };

    if let Err(e) = result {
        warn!(sid = %sess.sid, error = %e, "update user: failed");
        sess.queue_out(decode_store_error(&e, &msg.id, "", now, None));
        return;
    }

    match params {
        Some(params) => sess.queue_out(no_err_params(&msg.id, "", now, params)),
        None => sess.queue_out(no_err(&msg.id, "", now)),
    }

    sb.plugin_account(&user, AccountAction::Update);
}

/// Authentication update: login or password change.
async fn update_user_auth(
    sb: &Switchboard,
    user: &User,
    scheme: &str,
    secret: &[u8],
) -> Result<(), StoreError> {
    let Some(authhdl) = sb.auth.get(scheme) else {
        // Invalid or unknown auth scheme.
        return Err(StoreError::Malformed);
    };

    let mut rec = AuthRecord::new(user.id);
    rec.tags = user.tags.clone();
    let rec = authhdl.update_record(&rec, secret).await?;

    // Tags may have been rewritten; persist the result. Not much can be
    // done about a failure here, so it is logged and ignored.
    if let Err(e) = sb.store.update_tags(user.id, &[], &[], Some(&rec.tags)).await {
        warn!(user = %user.id.user_id(), error = %e, "failed to save rewritten tags");
    }
    Ok(())
}

/// Add the supplied credentials to a freshly created account. Returns all
/// methods validated in this call.
async fn add_creds(
    sb: &Switchboard,
    uid: Uid,
    creds: &[ClientCred],
    mut tags: Vec<String>,
    lang: &str,
    tmp_token: &[u8],
) -> Result<Vec<String>, StoreError> {
    let mut validated = Vec::new();
    for cr in creds {
        let Some(entry) = sb.validators.get(&cr.method) else {
            // Ignore unknown validators.
            continue;
        };

        entry
            .validator
            .request(uid, &cr.value, lang, &cr.response, tmp_token)
            .await?;

        if !cr.response.is_empty() {
            // A provided response that did not error means the credential
            // was validated in place.
            validated.push(cr.method.clone());
            if entry.add_to_tags {
                tags.push(format!("{}:{}", cr.method, cr.value));
            }
        }
    }

    // Save tags potentially extended by the confirmed credentials.
    if !tags.is_empty() {
        sb.store.update_tags(uid, &[], &[], Some(&tags)).await?;
    }

    Ok(validated)
}

/// Use the provided credentials to add, validate or remove the user's
/// credentials. Returns the methods holding at least one validated
/// credential after the update.
pub async fn update_creds(
    sb: &Switchboard,
    uid: Uid,
    auth_lvl: AuthLevel,
    creds: &[ClientCred],
) -> Result<Vec<String>, StoreError> {
    let required = sb.validators.required_for(auth_lvl);
    if required.is_empty() {
        // Credential validation is not applicable at this level.
        return Err(StoreError::Unsupported);
    }
    if creds.is_empty() {
        return Ok(Vec::new());
    }

    // Multiple validated credentials may share a method; index by count.
    let already_validated = sb.store.get_all_creds(uid, true).await?;
    let mut methods: HashMap<String, i64> = HashMap::new();
    for cred in &already_validated {
        *methods.entry(cred.method.clone()).or_insert(0) += 1;
    }

    let creds = normalize_credentials(sb, creds, false);
    let mut tags_to_add: Vec<String> = Vec::new();
    for cr in &creds {
        if cr.response.is_empty() {
            // Nothing to confirm.
            continue;
        }
        let Some(entry) = sb.validators.get(&cr.method) else {
            continue;
        };
        let value = match entry.validator.check(uid, &cr.response).await {
            Ok(value) => value,
            Err(StoreError::Credentials) => {
                // Just an invalid response. Keep the credential unvalidated.
                continue;
            }
            Err(e) => return Err(e),
        };

        if !value.is_empty() {
            *methods.entry(cr.method.clone()).or_insert(0) += 1;
            if entry.add_to_tags {
                tags_to_add.push(format!("{}:{}", cr.method, value));
            }
        } else {
            // The credential was removed while awaiting confirmation. Its
            // value is gone with it, so there is no tag left to strip.
            *methods.entry(cr.method.clone()).or_insert(0) -= 1;
        }
    }

    if !tags_to_add.is_empty() {
        sb.store.update_tags(uid, &tags_to_add, &[], None).await?;
    }

    let mut validated: Vec<String> = methods
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(method, _)| method)
        .collect();
    validated.sort();
    Ok(validated)
}

/// Delete one of the user's credentials. A credential of a required method
/// may only go when another validated credential of the same method remains.
pub async fn delete_cred(
    sb: &Switchboard,
    uid: Uid,
    auth_lvl: AuthLevel,
    cred: &ClientCred,
) -> Result<(), StoreError> {
    let Some(entry) = sb.validators.get(&cred.method) else {
        // Ignore unknown validation methods.
        return Ok(());
    };

    let is_required = sb
        .validators
        .required_for(auth_lvl)
        .iter()
        .any(|m| m == &cred.method);

    if is_required {
        // The method must remain validated after this credential is gone.
        let already_validated = sb.store.get_all_creds(uid, true).await?;
        let mut methods: HashMap<String, i64> = HashMap::new();
        for cr in &already_validated {
            *methods.entry(cr.method.clone()).or_insert(0) += 1;
        }
        if methods.get(&cred.method).copied().unwrap_or(0) < 2 {
            // This is the only validated credential of a required method.
            return Err(StoreError::Policy);
        }
    }

    entry.validator.remove(uid, &cred.value).await
}

/// Request to delete a user.
pub async fn delete_user(sb: &Arc<Switchboard>, sess: &Arc<Session>, msg: &ClientDel) {
    let now = time_now();

    let uid = if msg.user.is_empty() || msg.user == sess.uid().user_id() {
        sess.uid()
    } else if sess.auth_lvl() == AuthLevel::Root {
        match Uid::parse_user_id(&msg.user) {
            Some(uid) => uid,
            None => {
                warn!(sid = %sess.sid, user = %msg.user, "delete user: invalid user id");
                sess.queue_out(err_malformed(&msg.id, "", now));
                return;
            }
        }
    } else {
        warn!(sid = %sess.sid, user = %msg.user, "delete user: illegal attempt to delete another user");
        sess.queue_out(err_permission_denied(&msg.id, "", now));
        return;
    };
    if uid.is_zero() {
        sess.queue_out(err_permission_denied(&msg.id, "", now));
        return;
    }

    // Fetched ahead of deletion for the plugin hook.
    let user = sb.store.get_user(uid).await.ok().flatten();

    // Disable all authenticators. Individual failures can be benign: the
    // authenticator exists but was never used by this account.
    for name in sb.auth.names() {
        if let Some(handler) = sb.auth.get(&name) {
            if let Err(e) = handler.del_records(uid).await {
                warn!(user = %uid.user_id(), scheme = %name, error = %e, "delete user: failed to delete auth record");
            }
        }
    }

    // Terminate the user's other sessions; the current one stays so the
    // requester receives the reply.
    sb.sessions.evict_user(uid, &sess.sid, no_err_evicted("", "", now));

    // Stop topics the user participates in or owns, waiting for completion.
    sb.hub.unreg_user_sync(uid, msg.hard).await;

    // Notify users of interest that the user is gone.
    match sb.store.get_subs(uid).await {
        Ok(subs) => presence::pres_users_of_interest_offline(&sb.sessions, uid, &subs, "gone"),
        Err(e) => warn!(user = %uid.user_id(), error = %e, "delete user: failed to load subscriptions"),
    }

    // Notify subscribers of the group topics the user owned.
    match sb.store.get_own_topics(uid).await {
        Ok(topics) => {
            for topic in topics {
                match sb.store.get_topic_subs(&topic).await {
                    Ok(subs) => {
                        presence::pres_topic_gone(&sb.sessions, &topic, &subs, "gone", &sess.sid)
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "delete user: failed to load topic subscribers"),
                }
            }
        }
        Err(e) => warn!(user = %uid.user_id(), error = %e, "delete user: failed to list owned topics"),
    }

    // Delete the user's records.
    let reply = match sb.store.delete_user(uid, msg.hard).await {
        Ok(()) => no_err(&msg.id, "", now),
        Err(e) => {
            warn!(user = %uid.user_id(), error = %e, "delete user: failed to delete user");
            decode_store_error(&e, &msg.id, "", now, None)
        }
    };
    sess.queue_out(reply);

    if let Some(user) = user {
        sb.plugin_account(&user, AccountAction::Delete);
    }

    // Evict the current session when it belongs to the deleted user.
    if sess.uid() == uid {
        sess.stop(Some(no_err_evicted("", "", now)));
        sb.sessions.remove(&sess.sid);
    }
}

/// Authenticate the session with the given scheme and secret.
pub async fn login(sb: &Arc<Switchboard>, sess: &Arc<Session>, id: &str, scheme: &str, secret: &[u8]) {
    let now = time_now();

    if sess.is_authenticated() {
        sess.queue_out(err_already_authenticated(id, "", now));
        return;
    }
    let Some(authhdl) = sb.auth.get(scheme) else {
        warn!(sid = %sess.sid, scheme = %scheme, "login: unknown auth scheme");
        sess.queue_out(err_malformed(id, "", now));
        return;
    };

    let rec = match authhdl.authenticate(secret).await {
        Ok(rec) => rec,
        Err(e) => {
            warn!(sid = %sess.sid, error = %e, "login: failed");
            sess.queue_out(decode_store_error(&e, id, "", now, None));
            return;
        }
    };

    sess.set_identity(rec.uid, rec.auth_level);

    let mut params = json!({
        "user": rec.uid.user_id(),
        "authlvl": rec.auth_level.as_str(),
    });
    if let Some((token, expires)) = login_token(sb, rec.uid, rec.auth_level) {
        params["token"] = json!(token);
        params["expires"] = json!(expires);
    }

    // Report still-missing required credentials, if any.
    let required = sb.validators.required_for(rec.auth_level);
    if !required.is_empty() {
        if let Ok(validated) = sb.store.get_all_creds(rec.uid, true).await {
            let methods: Vec<String> = validated.into_iter().map(|c| c.method).collect();
            let missing = missing_methods(required, &methods);
            if !missing.is_empty() {
                params["cred"] = json!(missing);
            }
        }
    }

    info!(sid = %sess.sid, user = %rec.uid.user_id(), "session authenticated");
    sess.queue_out(no_err_params(id, "", now, params));
}

/// Compensating delete of a provisional account.
async fn compensate_delete(sb: &Switchboard, uid: Uid) {
    if let Err(e) = sb.store.delete_user(uid, false).await {
        warn!(user = %uid.user_id(), error = %e, "failed to delete incomplete user record");
    }
}

/// Short-lived no-login token for credential validation.
fn validation_token(sb: &Switchboard, uid: Uid) -> Vec<u8> {
    let Some(token_hdl) = sb.auth.get("token") else {
        return Vec::new();
    };
    let mut rec = AuthRecord::new(uid);
    rec.auth_level = AuthLevel::None;
    rec.lifetime = Some(VALIDATION_TOKEN_LIFETIME);
    rec.features = Features::NO_LOGIN;
    match token_hdl.gen_secret(&rec) {
        Ok((token, _)) => token,
        Err(_) => Vec::new(),
    }
}

/// Login token issued to an authenticated session.
fn login_token(sb: &Switchboard, uid: Uid, auth_level: AuthLevel) -> Option<(String, chrono::DateTime<chrono::Utc>)> {
    let token_hdl = sb.auth.get("token")?;
    let mut rec = AuthRecord::new(uid);
    rec.auth_level = auth_level;
    let (token, expires) = token_hdl.gen_secret(&rec).ok()?;
    Some((URL_SAFE_NO_PAD.encode(token), expires))
}

/// Parse a client-supplied default access mode; empty means "not provided".
fn parse_default_mode(s: &str) -> Option<AccessMode> {
    if s.is_empty() {
        return None;
    }
    match AccessMode::parse(s) {
        Ok(mode) if mode.is_defined() => Some(mode),
        _ => None,
    }
}

/// Clamp a default mode to what p2p topics support; any non-empty mode
/// implies the right to approve the peer.
fn clamp_p2p(mode: AccessMode) -> AccessMode {
    let clamped = mode & AccessMode::C_P2P;
    if clamped.is_zero() {
        clamped
    } else {
        clamped | AccessMode::APPROVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_keeps_p2p_bits_and_adds_approve() {
        let m = AccessMode::parse("JRWSDO").unwrap();
        assert_eq!(clamp_p2p(m).to_string(), "JRWA");
        assert_eq!(clamp_p2p(AccessMode::NONE), AccessMode::NONE);
    }

    #[test]
    fn default_mode_parsing() {
        assert_eq!(parse_default_mode(""), None);
        assert_eq!(parse_default_mode("JRW"), Some(AccessMode::parse("JRW").unwrap()));
        assert_eq!(parse_default_mode("??"), None);
    }
}
