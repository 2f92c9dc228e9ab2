//! Handshake admission.
//!
//! Checks run in a fixed order and the first failure decides the rejection
//! the client sees: protocol version, blacklist, password, session state,
//! display name, mandatory features, request filters, and finally slot
//! selection.

use crate::connection::{ClientIdentity, Connection};
use crate::context::ServerContext;
use crate::error::SlotError;
use crate::slots::{SlotId, SlotRequest};
use log::debug;
use shared::handshake::{HandshakeRejection, HandshakeRequest, HandshakeResponse};
use shared::{MAX_NAME_LENGTH, PROTOCOL_VERSION};
use std::sync::Arc;

/// Client feature that enables batched position updates.
pub const CUSTOM_UPDATE_FEATURE: &str = "CUSTOM_UPDATE";

/// Admits `request` for `connection` or explains why not.
///
/// On success the connection holds its identity and slot, and the returned
/// response has already been through the handshake observers.
pub(crate) fn admit(
    ctx: &ServerContext,
    connection: &Arc<Connection>,
    request: &HandshakeRequest,
) -> Result<HandshakeResponse, HandshakeRejection> {
    let config = ctx.config();
    let services = ctx.services();

    if request.client_version != PROTOCOL_VERSION {
        return Err(HandshakeRejection::UnsupportedProtocol {
            server_version: PROTOCOL_VERSION,
        });
    }
    if services.blacklist.is_blacklisted(request.guid) {
        return Err(HandshakeRejection::Blacklisted);
    }

    let is_admin = password_matches(config.admin_password.as_deref(), &request.password)
        || services.admins.is_admin(request.guid);
    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        if request.password != password && !is_admin {
            return Err(HandshakeRejection::WrongPassword);
        }
    }

    if !ctx.sessions().is_open() {
        return Err(HandshakeRejection::SessionClosed);
    }

    let name = display_name(&request.name);
    if name.is_empty() {
        return Err(HandshakeRejection::AuthFailed(
            "Your name must not be empty.".into(),
        ));
    }

    let missing = missing_features(&config.extra.mandatory_client_features, &request.features);
    if !missing.is_empty() {
        return Err(HandshakeRejection::AuthFailed(format!(
            "Missing client features: {}",
            missing.join(", ")
        )));
    }

    if !is_admin {
        ctx.filters()
            .should_accept(request)
            .map_err(HandshakeRejection::AuthFailed)?;
    }

    connection.set_identity(ClientIdentity::new(
        name,
        request.team.clone(),
        request.nation.clone(),
        request.guid,
        request.features.clone(),
    ));
    connection.set_admin(is_admin);

    let slot_request = SlotRequest {
        model: &request.requested_car,
        guid: request.guid,
        is_admin,
    };
    let slot_id = ctx
        .slots()
        .try_secure_slot(connection, &slot_request, ctx.filters())
        .map_err(|e| match e {
            SlotError::Unavailable => HandshakeRejection::NoSlotsAvailable,
            SlotError::Rejected(reason) => HandshakeRejection::AuthFailed(reason),
        })?;

    connection.set_custom_update(
        config.extra.enable_custom_update
            && request.features.iter().any(|f| f == CUSTOM_UPDATE_FEATURE),
    );
    debug!(
        "{} admitted to slot {} (admin: {}, custom update: {})",
        connection.name(),
        slot_id,
        is_admin,
        connection.supports_custom_update()
    );

    let mut response = build_response(ctx, slot_id);
    ctx.events().handshake_accepted(connection, &mut response);
    Ok(response)
}

fn password_matches(expected: Option<&str>, given: &str) -> bool {
    matches!(expected, Some(expected) if !expected.is_empty() && expected == given)
}

/// Truncates to the allowed length, then trims whitespace.
pub fn display_name(raw: &str) -> String {
    raw.chars()
        .take(MAX_NAME_LENGTH)
        .collect::<String>()
        .trim()
        .to_string()
}

fn missing_features<'a>(mandatory: &'a [String], offered: &[String]) -> Vec<&'a str> {
    mandatory
        .iter()
        .filter(|feature| !offered.contains(feature))
        .map(String::as_str)
        .collect()
}

fn build_response(ctx: &ServerContext, slot_id: SlotId) -> HandshakeResponse {
    let config = ctx.config();
    let assists = &config.assists;
    let weather = &ctx.services().weather;
    let now = ctx.now_ms();
    let (car_model, car_skin) = config
        .entries
        .get(slot_id as usize)
        .map(|entry| (entry.model.clone(), entry.skin.clone()))
        .unwrap_or_default();
    let (current_session_index, session_time) = ctx
        .sessions()
        .with_current(|state| (state.index as u8, state.session_time_ms(now)));

    HandshakeResponse {
        server_name: config.name.clone(),
        udp_port: config.udp_port,
        refresh_rate_hz: config.refresh_rate_hz as u8,
        track_name: config.track.clone(),
        track_config: config.track_config.clone(),
        car_model,
        car_skin,
        sun_angle: weather.sun_angle(),
        allowed_tyres_out: assists.allowed_tyres_out,
        tyre_blankets_allowed: assists.tyre_blankets_allowed,
        tc_allowed: assists.tc_allowed,
        abs_allowed: assists.abs_allowed,
        stability_allowed: assists.stability_allowed,
        autoclutch_allowed: assists.autoclutch_allowed,
        jump_start_penalty_mode: assists.jump_start_penalty_mode,
        mechanical_damage_rate: assists.mechanical_damage_rate,
        fuel_rate: assists.fuel_rate,
        tyre_rate: assists.tyre_rate,
        force_virtual_mirror: assists.force_virtual_mirror,
        max_contacts_per_km: assists.max_contacts_per_km,
        race_over_time: config.race_over_time_secs,
        result_screen_time: config.result_screen_time_secs,
        has_extra_lap: config.has_extra_lap,
        gas_penalty_disabled: config.gas_penalty_disabled,
        pit_window_start: config.pit_window_start,
        pit_window_end: config.pit_window_end,
        inverted_grid_positions: config.inverted_grid_positions,
        slot_id,
        sessions: ctx.sessions().sessions().to_vec(),
        current_session_index,
        session_time,
        checksum_paths: ctx.checksums().track_paths(),
        legal_tyres: config.legal_tyres.clone(),
        random_seed: ctx.random_seed(),
        server_time: now as i32,
        track_grip: weather.track_grip(),
    }
}
