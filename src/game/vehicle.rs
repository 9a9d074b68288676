//! Vehicle controller: input command -> physics-engine calls

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use super::physics::{BodyHandle, BodyKind, ColliderDesc, ColliderShape, PhysicsEngine, PhysicsError};

/// Driver input, consumed once per tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InputCommand {
    pub throttle: f32,
    pub brake: f32,
    pub steer: f32,
}

impl InputCommand {
    /// Clamp to the valid ranges; non-finite axes read as released
    pub fn sanitized(throttle: f32, brake: f32, steer: f32) -> Self {
        fn axis(v: f32, lo: f32, hi: f32) -> f32 {
            if v.is_finite() {
                v.clamp(lo, hi)
            } else {
                0.0
            }
        }
        Self {
            throttle: axis(throttle, -1.0, 1.0),
            brake: axis(brake, 0.0, 1.0),
            steer: axis(steer, -1.0, 1.0),
        }
    }
}

/// Vehicle handling constants
#[derive(Debug, Clone, Copy)]
pub struct VehicleTuning {
    pub mass: f32,
    pub half_extents: Vec3,
    /// Forward acceleration at full throttle (units/s²)
    pub engine_accel: f32,
    /// Reverse power relative to forward
    pub reverse_factor: f32,
    /// Yaw rate at full steer (rad/s)
    pub turn_rate: f32,
    /// Speed at which steering reaches full authority
    pub full_steer_speed: f32,
    /// Fraction of velocity removed per second at full brake
    pub brake_damping: f32,
    /// Rolling friction deceleration (units/s²)
    pub friction_decel: f32,
    pub max_speed: f32,
    pub max_angular_speed: f32,
}

impl Default for VehicleTuning {
    fn default() -> Self {
        Self {
            mass: 120.0,
            half_extents: Vec3::new(1.0, 0.5, 2.0),
            engine_accel: 25.0,
            reverse_factor: 0.5,
            turn_rate: 2.4,
            full_steer_speed: 6.0,
            brake_damping: 3.0,
            friction_decel: 4.0,
            max_speed: 32.0,
            max_angular_speed: 3.0,
        }
    }
}

/// Handling multiplier for the current carry state
pub fn handling_multiplier(carrying_flag: bool, carry_handling: f32) -> f32 {
    if carrying_flag {
        carry_handling
    } else {
        1.0
    }
}

/// Public pose of a vehicle, read back after the physics step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

/// Result of reading a pose back from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseStatus {
    Valid,
    /// Engine produced NaN/Infinity; the stored pose was left untouched
    NonFinite,
}

/// A player's vehicle and its rigid body
#[derive(Debug, Clone)]
pub struct Vehicle {
    body: BodyHandle,
    pose: Pose,
}

impl Vehicle {
    /// Create the rigid body at the given pose
    pub fn spawn(
        physics: &mut dyn PhysicsEngine,
        position: Vec3,
        rotation: Quat,
        tuning: &VehicleTuning,
    ) -> Result<Self, PhysicsError> {
        let body = physics.create_rigid_body(position, rotation, BodyKind::Dynamic);
        physics.create_collider(
            body,
            ColliderDesc {
                shape: ColliderShape::Cuboid {
                    half_extents: tuning.half_extents,
                },
                friction: 0.5,
                restitution: 0.0,
                mass: tuning.mass,
            },
        )?;
        Ok(Self {
            body,
            pose: Pose { position, rotation },
        })
    }

    /// Remove the rigid body from the engine
    pub fn despawn(self, physics: &mut dyn PhysicsEngine) -> Result<(), PhysicsError> {
        physics.remove_rigid_body(self.body)
    }

    pub fn body(&self) -> BodyHandle {
        self.body
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Translate one tick of input into impulses and velocity overrides.
    ///
    /// Order: drive impulse, steering bend, brake damping, friction, then the
    /// speed clamps so nothing applied earlier can exceed the limits.
    pub fn apply_command(
        &self,
        physics: &mut dyn PhysicsEngine,
        input: InputCommand,
        handling: f32,
        tuning: &VehicleTuning,
        dt: f32,
    ) -> Result<(), PhysicsError> {
        let body = self.body;
        let forward = horizontal_forward(physics.rotation(body)?);

        // Drive
        let accel = if input.throttle >= 0.0 {
            input.throttle * tuning.engine_accel
        } else {
            input.throttle * tuning.engine_accel * tuning.reverse_factor
        };
        if accel != 0.0 {
            physics.apply_impulse(body, forward * accel * tuning.mass * dt)?;
        }

        // Steering bends the horizontal velocity and turns the body with it
        let velocity = physics.linear_velocity(body)?;
        let horizontal = Vec3::new(velocity.x, 0.0, velocity.z);
        let speed = horizontal.length();
        let reversing = horizontal.dot(forward) < 0.0;
        let authority = (speed / tuning.full_steer_speed).min(1.0);
        let mut yaw_rate = -input.steer * tuning.turn_rate * handling * authority;
        if reversing {
            yaw_rate = -yaw_rate;
        }
        let bent = Quat::from_rotation_y(yaw_rate * dt) * horizontal;

        // Brake
        let keep = 1.0 - (input.brake * tuning.brake_damping * dt).min(1.0);
        let bent = bent * keep;
        physics.set_linear_velocity(body, Vec3::new(bent.x, velocity.y, bent.z))?;

        let angular = physics.angular_velocity(body)?;
        physics.set_angular_velocity(body, Vec3::new(angular.x, yaw_rate, angular.z))?;

        // Friction opposes horizontal motion but never reverses it
        let bent_speed = bent.length();
        if bent_speed > 0.0 {
            let dv = (tuning.friction_decel * dt).min(bent_speed);
            physics.apply_impulse(body, -bent / bent_speed * dv * tuning.mass)?;
        }

        // Clamps
        let velocity = physics.linear_velocity(body)?;
        if velocity.length() > tuning.max_speed {
            physics.set_linear_velocity(body, velocity.normalize() * tuning.max_speed)?;
        }
        let angular = physics.angular_velocity(body)?;
        if angular.length() > tuning.max_angular_speed {
            physics.set_angular_velocity(body, angular.normalize() * tuning.max_angular_speed)?;
        }
        Ok(())
    }

    /// Read the post-step pose; only finite poses become public
    pub fn sync_pose(&mut self, physics: &dyn PhysicsEngine) -> Result<PoseStatus, PhysicsError> {
        let position = physics.translation(self.body)?;
        let rotation = physics.rotation(self.body)?;
        if !position.is_finite() || !rotation.is_finite() {
            return Ok(PoseStatus::NonFinite);
        }
        self.pose = Pose {
            position,
            rotation: rotation.normalize(),
        };
        Ok(PoseStatus::Valid)
    }

    /// Recreate the body at a new pose with zero velocity
    pub fn teleport(
        &mut self,
        physics: &mut dyn PhysicsEngine,
        position: Vec3,
        rotation: Quat,
        tuning: &VehicleTuning,
    ) -> Result<(), PhysicsError> {
        // The old body may already be gone if the engine dropped it
        let _ = physics.remove_rigid_body(self.body);
        *self = Self::spawn(physics, position, rotation, tuning)?;
        Ok(())
    }
}

/// Unit forward vector (local -Z) flattened onto the ground plane
fn horizontal_forward(rotation: Quat) -> Vec3 {
    let f = rotation * Vec3::NEG_Z;
    let flat = Vec3::new(f.x, 0.0, f.z);
    flat.try_normalize().unwrap_or(Vec3::NEG_Z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{ArcadeWorld, PhysicsSettings};
    use crate::util::time::tick_delta;

    fn world_with_floor() -> ArcadeWorld {
        let mut world = ArcadeWorld::new(PhysicsSettings::default()).unwrap();
        let floor = world.create_rigid_body(Vec3::new(0.0, -1.0, 0.0), Quat::IDENTITY, BodyKind::Fixed);
        world
            .create_collider(
                floor,
                ColliderDesc {
                    shape: ColliderShape::Cuboid {
                        half_extents: Vec3::new(500.0, 1.0, 500.0),
                    },
                    friction: 0.8,
                    restitution: 0.0,
                    mass: 0.0,
                },
            )
            .unwrap();
        world
    }

    fn drive(world: &mut ArcadeWorld, vehicle: &mut Vehicle, input: InputCommand, handling: f32, ticks: usize) {
        let tuning = VehicleTuning::default();
        for _ in 0..ticks {
            vehicle
                .apply_command(world, input, handling, &tuning, tick_delta())
                .unwrap();
            world.step();
            assert_eq!(vehicle.sync_pose(world).unwrap(), PoseStatus::Valid);
        }
    }

    fn spawn(world: &mut ArcadeWorld) -> Vehicle {
        Vehicle::spawn(world, Vec3::new(0.0, 0.5, 0.0), Quat::IDENTITY, &VehicleTuning::default()).unwrap()
    }

    #[test]
    fn sanitize_clamps_and_zeroes_garbage() {
        let input = InputCommand::sanitized(5.0, -1.0, f32::NAN);
        assert_eq!(
            input,
            InputCommand {
                throttle: 1.0,
                brake: 0.0,
                steer: 0.0
            }
        );
    }

    #[test]
    fn throttle_drives_forward() {
        let mut world = world_with_floor();
        let mut vehicle = spawn(&mut world);
        let input = InputCommand {
            throttle: 1.0,
            ..Default::default()
        };
        drive(&mut world, &mut vehicle, input, 1.0, 60);
        // Local forward is -Z
        assert!(vehicle.pose().position.z < -5.0);
        assert!(vehicle.pose().position.x.abs() < 1e-3);
    }

    #[test]
    fn reverse_is_weaker_than_forward() {
        let mut world = world_with_floor();
        let mut fwd = spawn(&mut world);
        let mut rev = spawn(&mut world);
        drive(&mut world, &mut fwd, InputCommand { throttle: 1.0, ..Default::default() }, 1.0, 30);
        drive(&mut world, &mut rev, InputCommand { throttle: -1.0, ..Default::default() }, 1.0, 30);
        let fwd_dist = fwd.pose().position.z.abs();
        let rev_dist = rev.pose().position.z.abs();
        assert!(rev.pose().position.z > 0.0);
        assert!(rev_dist < fwd_dist);
    }

    #[test]
    fn speed_never_exceeds_limit() {
        let mut world = world_with_floor();
        let mut vehicle = spawn(&mut world);
        let tuning = VehicleTuning::default();
        drive(&mut world, &mut vehicle, InputCommand { throttle: 1.0, steer: 0.3, ..Default::default() }, 1.0, 600);
        let v = world.linear_velocity(vehicle.body()).unwrap();
        assert!(v.length() <= tuning.max_speed + 1e-3);
        let w = world.angular_velocity(vehicle.body()).unwrap();
        assert!(w.length() <= tuning.max_angular_speed + 1e-3);
    }

    #[test]
    fn carrying_a_flag_turns_slower() {
        let mut world = world_with_floor();
        let mut free = spawn(&mut world);
        let mut carrier = spawn(&mut world);
        let launch = InputCommand { throttle: 1.0, ..Default::default() };
        drive(&mut world, &mut free, launch, 1.0, 30);
        drive(&mut world, &mut carrier, launch, 1.0, 30);

        let turn = InputCommand { throttle: 1.0, steer: 1.0, ..Default::default() };
        drive(&mut world, &mut free, turn, handling_multiplier(false, 0.7), 20);
        drive(&mut world, &mut carrier, turn, handling_multiplier(true, 0.7), 20);

        let free_turn = free.pose().rotation.angle_between(Quat::IDENTITY);
        let carrier_turn = carrier.pose().rotation.angle_between(Quat::IDENTITY);
        assert!(carrier_turn < free_turn);
    }

    #[test]
    fn brake_slows_the_vehicle() {
        let mut world = world_with_floor();
        let mut vehicle = spawn(&mut world);
        drive(&mut world, &mut vehicle, InputCommand { throttle: 1.0, ..Default::default() }, 1.0, 60);
        let before = world.linear_velocity(vehicle.body()).unwrap().length();
        drive(&mut world, &mut vehicle, InputCommand { brake: 1.0, ..Default::default() }, 1.0, 10);
        let after = world.linear_velocity(vehicle.body()).unwrap().length();
        assert!(after < before * 0.7);
    }

    #[test]
    fn non_finite_pose_is_reported_and_not_published() {
        let mut world = world_with_floor();
        let mut vehicle = spawn(&mut world);
        let before = vehicle.pose();
        world
            .set_linear_velocity(vehicle.body(), Vec3::new(f32::NAN, 0.0, 0.0))
            .unwrap();
        world.step();
        assert_eq!(vehicle.sync_pose(&world).unwrap(), PoseStatus::NonFinite);
        assert_eq!(vehicle.pose(), before);
    }

    #[test]
    fn teleport_resets_velocity() {
        let mut world = world_with_floor();
        let mut vehicle = spawn(&mut world);
        drive(&mut world, &mut vehicle, InputCommand { throttle: 1.0, ..Default::default() }, 1.0, 30);
        vehicle
            .teleport(&mut world, Vec3::new(10.0, 0.5, 10.0), Quat::IDENTITY, &VehicleTuning::default())
            .unwrap();
        assert_eq!(world.linear_velocity(vehicle.body()).unwrap(), Vec3::ZERO);
        assert_eq!(vehicle.pose().position, Vec3::new(10.0, 0.5, 10.0));
        // floor + vehicle
        assert_eq!(world.body_count(), 2);
    }
}
