//! Rigid-body physics boundary
//!
//! The match never integrates motion itself: it feeds impulses and velocity
//! overrides to a [`PhysicsEngine`] and reads back poses after each step.
//! [`ArcadeWorld`] is the built-in backend, a small gravity + platform-support
//! integrator with no body-to-body contacts.

use std::collections::HashMap;

use glam::{Quat, Vec3};
use tracing::{error, warn};

use crate::util::time::tick_delta;

/// Opaque reference to a rigid body owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Dynamic,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColliderShape {
    Cuboid { half_extents: Vec3 },
    Ball { radius: f32 },
}

impl ColliderShape {
    /// Distance from the body origin to the bottom of the shape
    fn half_height(&self) -> f32 {
        match self {
            ColliderShape::Cuboid { half_extents } => half_extents.y,
            ColliderShape::Ball { radius } => *radius,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColliderDesc {
    pub shape: ColliderShape,
    pub friction: f32,
    pub restitution: f32,
    pub mass: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum PhysicsError {
    #[error("invalid physics configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("unknown rigid body {0:?}")]
    UnknownBody(BodyHandle),
}

/// The rigid-body engine as seen by the simulation
pub trait PhysicsEngine: Send {
    fn create_rigid_body(&mut self, position: Vec3, rotation: Quat, kind: BodyKind) -> BodyHandle;
    fn create_collider(&mut self, body: BodyHandle, desc: ColliderDesc) -> Result<(), PhysicsError>;
    fn remove_rigid_body(&mut self, body: BodyHandle) -> Result<(), PhysicsError>;

    fn apply_impulse(&mut self, body: BodyHandle, impulse: Vec3) -> Result<(), PhysicsError>;
    fn apply_torque_impulse(&mut self, body: BodyHandle, torque: Vec3) -> Result<(), PhysicsError>;
    fn set_linear_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> Result<(), PhysicsError>;
    fn set_angular_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> Result<(), PhysicsError>;

    fn linear_velocity(&self, body: BodyHandle) -> Result<Vec3, PhysicsError>;
    fn angular_velocity(&self, body: BodyHandle) -> Result<Vec3, PhysicsError>;
    fn translation(&self, body: BodyHandle) -> Result<Vec3, PhysicsError>;
    fn rotation(&self, body: BodyHandle) -> Result<Quat, PhysicsError>;

    /// Advance the world by one fixed timestep
    fn step(&mut self);

    /// Length of one [`PhysicsEngine::step`] in seconds
    fn timestep(&self) -> f32;

    fn body_count(&self) -> usize;
}

/// Tunables for [`ArcadeWorld`]
#[derive(Debug, Clone, Copy)]
pub struct PhysicsSettings {
    pub gravity: Vec3,
    pub timestep: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
}

impl Default for PhysicsSettings {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -20.0, 0.0),
            timestep: tick_delta(),
            linear_damping: 0.1,
            angular_damping: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Body {
    kind: BodyKind,
    position: Vec3,
    rotation: Quat,
    linvel: Vec3,
    angvel: Vec3,
    inv_mass: f32,
    collider: Option<ColliderDesc>,
}

/// How far below a platform top a falling body may sink and still be caught
const SUPPORT_TOLERANCE: f32 = 0.5;

/// Built-in physics backend
pub struct ArcadeWorld {
    settings: PhysicsSettings,
    bodies: HashMap<BodyHandle, Body>,
    next_handle: u32,
}

impl ArcadeWorld {
    pub fn new(settings: PhysicsSettings) -> Result<Self, PhysicsError> {
        if !settings.gravity.is_finite() {
            return Err(PhysicsError::InvalidConfig("gravity must be finite"));
        }
        if !(settings.timestep.is_finite() && settings.timestep > 0.0) {
            return Err(PhysicsError::InvalidConfig("timestep must be positive"));
        }
        if settings.linear_damping < 0.0 || settings.angular_damping < 0.0 {
            return Err(PhysicsError::InvalidConfig("damping must be non-negative"));
        }
        Ok(Self {
            settings,
            bodies: HashMap::new(),
            next_handle: 0,
        })
    }

    fn body(&self, handle: BodyHandle) -> Result<&Body, PhysicsError> {
        self.bodies.get(&handle).ok_or(PhysicsError::UnknownBody(handle))
    }

    fn body_mut(&mut self, handle: BodyHandle) -> Result<&mut Body, PhysicsError> {
        self.bodies
            .get_mut(&handle)
            .ok_or(PhysicsError::UnknownBody(handle))
    }

    /// Height of the highest fixed cuboid top under `(x, z)` that a body whose
    /// bottom was at `prev_bottom` can land on
    fn support_height(&self, x: f32, z: f32, prev_bottom: f32) -> Option<f32> {
        self.bodies
            .values()
            .filter(|b| b.kind == BodyKind::Fixed)
            .filter_map(|b| match b.collider?.shape {
                ColliderShape::Cuboid { half_extents } => Some((b.position, half_extents)),
                ColliderShape::Ball { .. } => None,
            })
            .filter(|(center, he)| {
                (x - center.x).abs() <= he.x && (z - center.z).abs() <= he.z
            })
            .map(|(center, he)| center.y + he.y)
            .filter(|top| prev_bottom >= top - SUPPORT_TOLERANCE)
            .reduce(f32::max)
    }
}

impl PhysicsEngine for ArcadeWorld {
    fn create_rigid_body(&mut self, position: Vec3, rotation: Quat, kind: BodyKind) -> BodyHandle {
        let handle = BodyHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.bodies.insert(
            handle,
            Body {
                kind,
                position,
                rotation,
                linvel: Vec3::ZERO,
                angvel: Vec3::ZERO,
                inv_mass: if kind == BodyKind::Dynamic { 1.0 } else { 0.0 },
                collider: None,
            },
        );
        handle
    }

    fn create_collider(&mut self, body: BodyHandle, desc: ColliderDesc) -> Result<(), PhysicsError> {
        let body = self.body_mut(body)?;
        if body.kind == BodyKind::Dynamic && desc.mass > 0.0 {
            body.inv_mass = 1.0 / desc.mass;
        }
        body.collider = Some(desc);
        Ok(())
    }

    fn remove_rigid_body(&mut self, body: BodyHandle) -> Result<(), PhysicsError> {
        self.bodies
            .remove(&body)
            .map(|_| ())
            .ok_or(PhysicsError::UnknownBody(body))
    }

    fn apply_impulse(&mut self, body: BodyHandle, impulse: Vec3) -> Result<(), PhysicsError> {
        let body = self.body_mut(body)?;
        body.linvel += impulse * body.inv_mass;
        Ok(())
    }

    fn apply_torque_impulse(&mut self, body: BodyHandle, torque: Vec3) -> Result<(), PhysicsError> {
        // Unit inertia tensor scaled by mass
        let body = self.body_mut(body)?;
        body.angvel += torque * body.inv_mass;
        Ok(())
    }

    fn set_linear_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> Result<(), PhysicsError> {
        let body = self.body_mut(body)?;
        if body.kind == BodyKind::Dynamic {
            body.linvel = velocity;
        }
        Ok(())
    }

    fn set_angular_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> Result<(), PhysicsError> {
        let body = self.body_mut(body)?;
        if body.kind == BodyKind::Dynamic {
            body.angvel = velocity;
        }
        Ok(())
    }

    fn linear_velocity(&self, body: BodyHandle) -> Result<Vec3, PhysicsError> {
        Ok(self.body(body)?.linvel)
    }

    fn angular_velocity(&self, body: BodyHandle) -> Result<Vec3, PhysicsError> {
        Ok(self.body(body)?.angvel)
    }

    fn translation(&self, body: BodyHandle) -> Result<Vec3, PhysicsError> {
        Ok(self.body(body)?.position)
    }

    fn rotation(&self, body: BodyHandle) -> Result<Quat, PhysicsError> {
        Ok(self.body(body)?.rotation)
    }

    fn step(&mut self) {
        let dt = self.settings.timestep;
        let gravity = self.settings.gravity;
        let lin_damp = 1.0 / (1.0 + dt * self.settings.linear_damping);
        let ang_damp = 1.0 / (1.0 + dt * self.settings.angular_damping);

        let dynamic: Vec<BodyHandle> = self
            .bodies
            .iter()
            .filter(|(_, b)| b.kind == BodyKind::Dynamic)
            .map(|(h, _)| *h)
            .collect();

        for handle in dynamic {
            let Some(body) = self.bodies.get(&handle) else {
                continue;
            };
            let half_height = body.collider.map(|c| c.shape.half_height()).unwrap_or(0.5);
            let restitution = body.collider.map(|c| c.restitution).unwrap_or(0.0);
            let prev_bottom = body.position.y - half_height;

            // Semi-implicit Euler
            let linvel = (body.linvel + gravity * dt) * lin_damp;
            let angvel = body.angvel * ang_damp;
            let mut position = body.position + linvel * dt;
            let rotation = (Quat::from_scaled_axis(angvel * dt) * body.rotation).normalize();

            let mut linvel = linvel;
            if let Some(top) = self.support_height(position.x, position.z, prev_bottom) {
                if position.y - half_height < top {
                    position.y = top + half_height;
                    if linvel.y < 0.0 {
                        linvel.y = -linvel.y * restitution;
                    }
                }
            }

            if let Some(body) = self.bodies.get_mut(&handle) {
                body.position = position;
                body.rotation = rotation;
                body.linvel = linvel;
                body.angvel = angvel;
            }
        }
    }

    fn timestep(&self) -> f32 {
        self.settings.timestep
    }

    fn body_count(&self) -> usize {
        self.bodies.len()
    }
}

/// Run `init` up to `attempts` times; the last failure is returned
pub fn init_with_retry<W, F>(attempts: u32, mut init: F) -> Result<W, PhysicsError>
where
    F: FnMut() -> Result<W, PhysicsError>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match init() {
            Ok(world) => return Ok(world),
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, error = %e, "Physics initialization failed, retrying");
                attempt += 1;
            }
            Err(e) => {
                error!(attempts, error = %e, "Physics initialization failed");
                return Err(e);
            }
        }
    }
}
