// Controller GPIO pin mapping
//
//| GPIO # | Name       | Description                                               |
//| ------ | ---------- | --------------------------------------------------------- |
//| 2      | I2C1_SDA   | Register bus data line. The host is primary.              |
//| 3      | I2C1_SCL   | Register bus clock line. The host is primary.             |
//| 4      | LED_BTN    | Shared LED/button pin. Pull-up input, active-low button.  |
//| 5      | PWR_SW     | Host power-switch output (level or pulse, per config).    |
//| 26     | BAT_S      | Analog: divided battery voltage.                          |
//| 27     | EXT_S      | Analog: divided external rail voltage, supply-referenced. |

use assign_resources::assign_resources;
use embassy_rp::peripherals;

assign_resources! {
  i2cs: I2CSecondaryResources {
    sda: PIN_2,
    scl: PIN_3,
    i2c: I2C1,
  },
  led_button: LedButtonResources {
    pin: PIN_4,
  },
  power_switch: PowerSwitchResources {
    pin: PIN_5,
  },
  analog: AnalogResources {
    adc: ADC,
    bat_sense: PIN_26,
    ext_sense: PIN_27,
    temp_sensor: ADC_TEMP_SENSOR,
  },
}
